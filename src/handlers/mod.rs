pub mod health;
pub mod patterns;
pub mod series;
