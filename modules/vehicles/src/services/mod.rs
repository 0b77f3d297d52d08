pub mod vehicle_service;
