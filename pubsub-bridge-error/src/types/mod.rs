pub mod pubsub;
pub mod transport;

// Публичный экспорт всех типов ошибок из вложенных модулей.
pub use pubsub::*;
pub use transport::*;
