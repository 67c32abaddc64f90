pub mod dispatcher;
pub mod registry;
pub mod session;
pub mod storage;
