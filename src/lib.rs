pub mod virtualbox;
