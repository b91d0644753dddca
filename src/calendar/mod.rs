pub mod book;
pub mod event;

pub use book::EventBook;
pub use event::{Event, LocalId, RemoteId, DEFAULT_TITLE_COLOR};
