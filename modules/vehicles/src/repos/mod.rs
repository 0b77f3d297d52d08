pub mod vehicle_repo;
pub mod vehicle_type_cache_repo;
