pub mod queues;
pub mod work;
