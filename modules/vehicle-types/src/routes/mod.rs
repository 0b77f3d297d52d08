pub mod vehicle_types;
