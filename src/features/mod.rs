pub mod attempts;
pub mod detector;
pub mod gate;
pub mod notify;
pub mod recorder;
pub mod waiter;
