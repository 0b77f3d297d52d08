pub mod vehicle_type_consumer;
