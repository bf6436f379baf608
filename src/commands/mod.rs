pub mod dispatch;
pub mod enqueue;
pub mod report;
pub mod status;
pub mod worker;
