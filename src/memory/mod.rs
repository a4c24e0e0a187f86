pub mod space;
pub mod static_alloc;
