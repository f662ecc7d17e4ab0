pub mod util;
pub mod crypto;
pub mod bert;
pub mod blockquick;
pub mod ticket;
pub mod merkle;
pub mod contract;
