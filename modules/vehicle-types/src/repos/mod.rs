pub mod vehicle_type_repo;
