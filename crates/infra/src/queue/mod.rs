pub mod postgres;

pub use postgres::PostgresMessageQueue;
