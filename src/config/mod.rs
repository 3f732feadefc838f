// Static configuration tables

pub mod default_roles;

pub use default_roles::default_roles;
