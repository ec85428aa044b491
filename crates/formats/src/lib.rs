pub mod road_network;

pub use road_network::*;
