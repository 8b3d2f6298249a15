pub mod block_list;
pub mod registry;
