pub mod operation;
pub mod request_scope;
pub mod resource;
pub mod resource_type;
