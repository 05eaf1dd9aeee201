pub mod db;
pub mod source;
pub mod types;
pub mod vector;
