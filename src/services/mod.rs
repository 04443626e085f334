pub mod blob_store;
pub mod cascade;
pub mod disk_store;
pub mod folders;
pub mod keys;
pub mod meta_store;
pub mod tracker;
pub mod trash;
