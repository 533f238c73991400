pub mod error;
pub mod fanout;
pub mod ordering;
pub mod reconciler;

pub use error::EngineError;
pub use fanout::{NotificationChannel, NotificationFanout};
pub use ordering::OrderingStore;
pub use reconciler::{Applied, BoardShadow, ClientReconciler, PendingState};
