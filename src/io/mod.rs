pub mod buffer_pool;
pub mod byte_channel;
