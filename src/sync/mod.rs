mod event_lock;
pub mod gateway;
pub mod network;
pub mod remote_api;
pub mod sync_engine;

#[cfg(test)]
pub(crate) mod testing;
