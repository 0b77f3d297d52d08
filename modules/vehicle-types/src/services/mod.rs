pub mod vehicle_type_service;
