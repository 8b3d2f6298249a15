pub mod free_list;
pub mod size_class;
