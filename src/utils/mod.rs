mod async_task;
mod error_recorder;
pub(crate) use async_task::*;
pub(crate) use error_recorder::*;
