pub use super::operations::Entity as Operations;
pub use super::resources::Entity as Resources;
