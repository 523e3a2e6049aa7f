//! Persistent feed connection with subscription bookkeeping and reconnect.
//!
//! A single task owns the transport, the subscription book and the backoff
//! counter. Callers talk to it only through [`FeedHandle`] commands and read
//! what it produces from the event channel returned by [`spawn`].

mod backoff;
mod book;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::config::FeedConfig;
use crate::errors::FeedError;
use crate::models::candle::Candle;
use crate::models::feed::{
    parse_inbound, ping_frame, subscribe_frame, unsubscribe_frame, FeedMessage, Subscription,
    Trade,
};

use backoff::Backoff;
use book::SubscriptionBook;
pub use transport::{FeedConnector, FeedTransport, WsConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Open => "open",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: LinkState,
    /// Consecutive failed attempts since the last successful open
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Attempt cap exhausted; nothing more happens until `connect()`
    Terminal,
    Candles(Vec<Candle>),
    Trades(Vec<Trade>),
}

#[derive(Debug)]
enum Command {
    Connect,
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Close,
}

#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl FeedHandle {
    /// Open the connection. No-op while open or while an attempt is pending.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    pub fn subscribe(&self, subscription: Subscription) {
        self.send(Command::Subscribe(subscription));
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.send(Command::Unsubscribe(subscription));
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("feed task has stopped, command dropped");
        }
    }
}

/// Start the connection task. It stays idle until [`FeedHandle::connect`].
pub fn spawn(
    connector: Arc<dyn FeedConnector>,
    config: FeedConfig,
) -> (FeedHandle, mpsc::UnboundedReceiver<FeedEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus {
        state: LinkState::Idle,
        reconnect_attempts: 0,
    });

    let actor = FeedActor {
        connector,
        backoff: Backoff::new(config.reconnect_base, config.max_reconnect_attempts),
        config,
        book: SubscriptionBook::default(),
        commands: command_rx,
        events: event_tx,
        status: status_tx,
    };
    tokio::spawn(actor.run());

    (
        FeedHandle {
            commands: command_tx,
            status: status_rx,
        },
        event_rx,
    )
}

enum Link {
    Idle,
    Open {
        transport: Box<dyn FeedTransport>,
        heartbeat: Interval,
    },
    /// Reconnect pending at the deadline
    Waiting(Instant),
    Failed,
    Stopped,
}

struct FeedActor {
    connector: Arc<dyn FeedConnector>,
    config: FeedConfig,
    book: SubscriptionBook,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<FeedEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl FeedActor {
    async fn run(mut self) {
        let mut link = Link::Idle;
        loop {
            link = match link {
                Link::Idle => self.idle(false).await,
                Link::Failed => self.idle(true).await,
                Link::Waiting(deadline) => self.waiting(deadline).await,
                Link::Open {
                    transport,
                    heartbeat,
                } => self.open_loop(transport, heartbeat).await,
                Link::Stopped => break,
            };
        }
        tracing::debug!("feed task stopped");
    }

    async fn idle(&mut self, failed: bool) -> Link {
        loop {
            match self.commands.recv().await {
                None => return Link::Stopped,
                Some(Command::Connect) => {
                    self.backoff.reset();
                    return self.open().await;
                }
                Some(Command::Subscribe(subscription)) => {
                    self.book.insert(subscription);
                }
                Some(Command::Unsubscribe(subscription)) => {
                    self.book.remove(&subscription);
                }
                Some(Command::Close) if failed => {
                    self.backoff.reset();
                    self.publish(LinkState::Idle);
                    return Link::Idle;
                }
                Some(Command::Close) => {}
            }
        }
    }

    async fn waiting(&mut self, deadline: Instant) -> Link {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return self.open().await,
                command = self.commands.recv() => match command {
                    None => return Link::Stopped,
                    // an attempt is already scheduled
                    Some(Command::Connect) => {}
                    Some(Command::Subscribe(subscription)) => {
                        self.book.insert(subscription);
                    }
                    Some(Command::Unsubscribe(subscription)) => {
                        self.book.remove(&subscription);
                    }
                    Some(Command::Close) => {
                        tracing::info!("feed closed, pending reconnect cancelled");
                        self.backoff.reset();
                        self.publish(LinkState::Idle);
                        return Link::Idle;
                    }
                },
            }
        }
    }

    async fn open(&mut self) -> Link {
        let state = if self.backoff.attempts() == 0 {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting
        };
        self.publish(state);

        let connector = self.connector.clone();
        let attempt = connector.connect();
        tokio::pin!(attempt);

        let connected = loop {
            tokio::select! {
                result = &mut attempt => break result,
                command = self.commands.recv() => match command {
                    None => return Link::Stopped,
                    // an attempt is already in flight
                    Some(Command::Connect) => {}
                    Some(Command::Subscribe(subscription)) => {
                        self.book.insert(subscription);
                    }
                    Some(Command::Unsubscribe(subscription)) => {
                        self.book.remove(&subscription);
                    }
                    Some(Command::Close) => {
                        tracing::info!("feed closed, connect attempt abandoned");
                        self.backoff.reset();
                        self.publish(LinkState::Idle);
                        return Link::Idle;
                    }
                },
            }
        };

        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("feed connect failed: {}", e);
                return self.schedule_reconnect();
            }
        };

        self.backoff.reset();
        self.publish(LinkState::Open);
        self.emit(FeedEvent::Connected);
        tracing::info!(
            "feed connected, replaying {} subscriptions",
            self.book.len()
        );

        let frames: Result<Vec<String>, FeedError> = self.book.iter().map(subscribe_frame).collect();
        let sent = match frames {
            Ok(frames) => send_all(transport.as_mut(), frames).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            transport.close().await;
            return self.dropped(e.to_string());
        }

        let period = self.config.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Link::Open {
            transport,
            heartbeat,
        }
    }

    async fn open_loop(
        &mut self,
        mut transport: Box<dyn FeedTransport>,
        mut heartbeat: Interval,
    ) -> Link {
        loop {
            let outcome: Result<(), FeedError> = tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        transport.close().await;
                        return Link::Stopped;
                    }
                    Some(Command::Connect) => Ok(()),
                    Some(Command::Subscribe(subscription)) => {
                        if self.book.insert(subscription.clone()) {
                            match subscribe_frame(&subscription) {
                                Ok(frame) => transport.send(frame).await,
                                Err(e) => Err(e),
                            }
                        } else {
                            Ok(())
                        }
                    }
                    Some(Command::Unsubscribe(subscription)) => {
                        if self.book.remove(&subscription) {
                            match unsubscribe_frame(&subscription) {
                                Ok(frame) => transport.send(frame).await,
                                Err(e) => Err(e),
                            }
                        } else {
                            Ok(())
                        }
                    }
                    Some(Command::Close) => {
                        tracing::info!("closing feed connection");
                        transport.close().await;
                        self.backoff.reset();
                        self.publish(LinkState::Idle);
                        self.emit(FeedEvent::Disconnected {
                            reason: "closed by client".to_string(),
                        });
                        return Link::Idle;
                    }
                },
                inbound = transport.recv() => match inbound {
                    Some(Ok(text)) => {
                        self.dispatch(&text);
                        Ok(())
                    }
                    Some(Err(e)) => Err(e),
                    None => return self.dropped("connection closed by peer".to_string()),
                },
                _ = heartbeat.tick() => match ping_frame() {
                    Ok(frame) => transport.send(frame).await,
                    Err(e) => Err(e),
                },
            };

            if let Err(e) = outcome {
                transport.close().await;
                return self.dropped(e.to_string());
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match parse_inbound(text) {
            Ok(FeedMessage::Candles(candles)) => self.emit(FeedEvent::Candles(candles)),
            Ok(FeedMessage::Trades(trades)) => self.emit(FeedEvent::Trades(trades)),
            Ok(FeedMessage::Ignored(channel)) => {
                tracing::debug!("ignoring feed message on channel {}", channel);
            }
            Err(e) => tracing::warn!("dropping feed message: {}", e),
        }
    }

    fn dropped(&mut self, reason: String) -> Link {
        tracing::warn!("feed connection lost: {}", reason);
        self.emit(FeedEvent::Disconnected { reason });
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> Link {
        match self.backoff.next_delay() {
            Some(delay) => {
                let attempt = self.backoff.attempts();
                tracing::info!(
                    "reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    self.config.max_reconnect_attempts
                );
                self.publish(LinkState::Reconnecting);
                self.emit(FeedEvent::ReconnectScheduled { attempt, delay });
                Link::Waiting(Instant::now() + delay)
            }
            None => {
                tracing::error!(
                    "feed gave up after {} reconnect attempts",
                    self.backoff.attempts()
                );
                self.publish(LinkState::Failed);
                self.emit(FeedEvent::Terminal);
                Link::Failed
            }
        }
    }

    fn publish(&self, state: LinkState) {
        self.status.send_replace(ConnectionStatus {
            state,
            reconnect_attempts: self.backoff.attempts(),
        });
    }

    fn emit(&self, event: FeedEvent) {
        // receiver gone means the process is shutting down
        let _ = self.events.send(event);
    }
}

async fn send_all(transport: &mut dyn FeedTransport, frames: Vec<String>) -> Result<(), FeedError> {
    for frame in frames {
        transport.send(frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Test-side end of one accepted connection.
    struct Peer {
        sent: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::UnboundedSender<String>,
    }

    struct MockTransport {
        sent: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl FeedTransport for MockTransport {
        async fn send(&mut self, text: String) -> Result<(), FeedError> {
            self.sent
                .send(text)
                .map_err(|_| FeedError::Transport("peer gone".to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String, FeedError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {}
    }

    /// Accepts or refuses attempts from a script, then falls back.
    struct MockConnector {
        script: Mutex<VecDeque<bool>>,
        fallback: bool,
        attempts: Mutex<Vec<Instant>>,
        peers: mpsc::UnboundedSender<Peer>,
    }

    impl MockConnector {
        fn new(script: &[bool], fallback: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
            let (peers, peer_rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                attempts: Mutex::new(Vec::new()),
                peers,
            });
            (connector, peer_rx)
        }

        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedConnector for MockConnector {
        async fn connect(&self) -> Result<Box<dyn FeedTransport>, FeedError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let accept = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            if !accept {
                return Err(FeedError::Connect("refused".to_string()));
            }

            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let _ = self.peers.send(Peer {
                sent: sent_rx,
                inbound: inbound_tx,
            });
            Ok(Box::new(MockTransport {
                sent: sent_tx,
                inbound: inbound_rx,
            }))
        }
    }

    /// Connect attempts that never resolve.
    struct Hanging {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl FeedConnector for Hanging {
        async fn connect(&self) -> Result<Box<dyn FeedTransport>, FeedError> {
            *self.attempts.lock().unwrap() += 1;
            std::future::pending().await
        }
    }

    fn config(max_reconnect_attempts: u32) -> FeedConfig {
        FeedConfig {
            ws_url: "ws://test".to_string(),
            heartbeat: Duration::from_secs(3_600),
            reconnect_base: Duration::from_secs(1),
            max_reconnect_attempts,
        }
    }

    fn frame(subscription: &Subscription) -> String {
        subscribe_frame(subscription).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_backs_off_from_base_and_doubles() {
        let (connector, mut peers) = MockConnector::new(&[true, false, false, true], true);
        let (handle, mut events) = spawn(connector.clone(), config(5));

        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));

        drop(peers.recv().await);
        assert!(matches!(events.recv().await, Some(FeedEvent::Disconnected { .. })));
        assert_eq!(
            events.recv().await,
            Some(FeedEvent::ReconnectScheduled { attempt: 1, delay: Duration::from_secs(1) })
        );
        assert_eq!(
            events.recv().await,
            Some(FeedEvent::ReconnectScheduled { attempt: 2, delay: Duration::from_secs(2) })
        );
        assert_eq!(
            events.recv().await,
            Some(FeedEvent::ReconnectScheduled { attempt: 3, delay: Duration::from_secs(4) })
        );
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));

        let times = connector.attempt_times();
        assert_eq!(times.len(), 4);
        assert!(times[2] - times[1] >= Duration::from_secs(2));
        assert!(times[3] - times[2] >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_resets_after_successful_open() {
        let (connector, mut peers) = MockConnector::new(&[true, false], true);
        let (handle, mut events) = spawn(connector, config(5));

        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));
        drop(peers.recv().await);

        // refused once, then accepted
        loop {
            if events.recv().await == Some(FeedEvent::Connected) {
                break;
            }
        }
        assert_eq!(handle.status().reconnect_attempts, 0);
        assert_eq!(handle.status().state, LinkState::Open);

        // dropped again: schedule starts over at the base delay
        drop(peers.recv().await);
        assert!(matches!(events.recv().await, Some(FeedEvent::Disconnected { .. })));
        assert_eq!(
            events.recv().await,
            Some(FeedEvent::ReconnectScheduled { attempt: 1, delay: Duration::from_secs(1) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_subscriptions_flush_in_registration_order() {
        let (connector, mut peers) = MockConnector::new(&[], true);
        let (handle, mut events) = spawn(connector, config(5));

        let subs = [
            Subscription::candles("ETH", "1m"),
            Subscription::trades("ETH"),
            Subscription::candles("BTC", "1m"),
        ];
        for sub in &subs {
            handle.subscribe(sub.clone());
        }
        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));

        let mut peer = peers.recv().await.unwrap();
        for sub in &subs {
            assert_eq!(peer.sent.recv().await, Some(frame(sub)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_topic_is_not_replayed_after_reconnect() {
        let (connector, mut peers) = MockConnector::new(&[], true);
        let (handle, mut events) = spawn(connector, config(5));

        handle.subscribe(Subscription::candles("BTC", "1m"));
        handle.subscribe(Subscription::trades("BTC"));
        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));

        let mut first = peers.recv().await.unwrap();
        first.sent.recv().await;
        first.sent.recv().await;

        // the duplicate sends nothing, so the next frame is the unsubscribe
        handle.subscribe(Subscription::candles("BTC", "1m"));
        handle.unsubscribe(Subscription::trades("BTC"));
        assert_eq!(
            first.sent.recv().await,
            Some(unsubscribe_frame(&Subscription::trades("BTC")).unwrap())
        );

        drop(first);
        loop {
            if events.recv().await == Some(FeedEvent::Connected) {
                break;
            }
        }

        let mut second = peers.recv().await.unwrap();
        assert_eq!(
            second.sent.recv().await,
            Some(frame(&Subscription::candles("BTC", "1m")))
        );
        assert!(second.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_cap_until_explicit_connect() {
        let (connector, _peers) = MockConnector::new(&[], false);
        let (handle, mut events) = spawn(connector.clone(), config(3));

        handle.connect();
        for attempt in 1..=3 {
            match events.recv().await {
                Some(FeedEvent::ReconnectScheduled { attempt: n, .. }) => assert_eq!(n, attempt),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(events.recv().await, Some(FeedEvent::Terminal));
        assert_eq!(handle.status().state, LinkState::Failed);

        // no further attempts on its own
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempt_times().len(), 4);

        handle.connect();
        assert_eq!(
            events.recv().await,
            Some(FeedEvent::ReconnectScheduled { attempt: 1, delay: Duration::from_secs(1) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_is_dropped_and_stream_continues() {
        let (connector, mut peers) = MockConnector::new(&[], true);
        let (handle, mut events) = spawn(connector, config(5));

        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));
        let peer = peers.recv().await.unwrap();

        peer.inbound.send("{not json".to_string()).unwrap();
        peer.inbound
            .send(r#"{"channel":"subscriptionResponse","data":{}}"#.to_string())
            .unwrap();
        peer.inbound
            .send(
                r#"{"channel":"candle","data":{"t":0,"T":59999,"s":"BTC","i":"1m",
                "o":"1","c":"2","h":"3","l":"0.5","v":"10","n":4}}"#
                    .to_string(),
            )
            .unwrap();

        match events.recv().await {
            Some(FeedEvent::Candles(candles)) => assert_eq!(candles[0].instrument, "BTC"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.status().state, LinkState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_open() {
        let (connector, mut peers) = MockConnector::new(&[], true);
        let mut feed_config = config(5);
        feed_config.heartbeat = Duration::from_secs(30);
        let (handle, mut events) = spawn(connector, feed_config);

        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));
        let mut peer = peers.recv().await.unwrap();

        let started = Instant::now();
        assert_eq!(peer.sent.recv().await, Some(ping_frame().unwrap()));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_reconnect() {
        let (connector, mut peers) = MockConnector::new(&[], true);
        let (handle, mut events) = spawn(connector.clone(), config(5));

        handle.connect();
        handle.connect();
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));
        let _peer = peers.recv().await.unwrap();

        handle.close();
        let mut status = handle.watch_status();
        status
            .wait_for(|s| s.state == LinkState::Idle)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempt_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_abandons_a_hung_connect() {
        let connector = Arc::new(Hanging {
            attempts: Mutex::new(0),
        });
        let (handle, _events) = spawn(connector.clone(), config(5));
        let mut status = handle.watch_status();

        handle.connect();
        status
            .wait_for(|s| s.state == LinkState::Connecting)
            .await
            .unwrap();

        // commands are still served while the attempt hangs
        handle.connect();
        handle.subscribe(Subscription::candles("BTC", "1m"));
        handle.close();
        status
            .wait_for(|s| s.state == LinkState::Idle)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(handle.status().state, LinkState::Idle);
        assert_eq!(*connector.attempts.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_made_during_connect_is_sent_on_open() {
        let (connector, mut peers) = MockConnector::new(&[], true);
        let (handle, mut events) = spawn(connector, config(5));

        handle.connect();
        handle.subscribe(Subscription::trades("ETH"));
        assert_eq!(events.recv().await, Some(FeedEvent::Connected));

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.sent.recv().await, Some(frame(&Subscription::trades("ETH"))));
    }
}
