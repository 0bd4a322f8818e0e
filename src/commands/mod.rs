pub mod comparison_stream;
pub mod health;
