//! Engine services: candidate selection, partition assignment, the object
//! transfer protocol and the coordinator driving a full sync pass.

pub mod coordinator;
pub mod data_path;
pub mod partition;
pub mod run_lock;
pub mod selector;
pub mod transfer;
