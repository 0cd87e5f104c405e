pub mod client {
    pub mod models {
        pub mod common;
        pub mod nav;
    }
    pub mod client;
    pub mod error;
}

pub mod config;
pub mod logger;
pub mod models;
pub mod utils;
pub mod wbi_utils;
