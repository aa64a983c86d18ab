pub mod db;
pub mod mapping;
pub mod run;
