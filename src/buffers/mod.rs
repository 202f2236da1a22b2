pub mod packet_pool;
