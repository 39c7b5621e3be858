
mod sweeps;
pub use self::sweeps::*;
mod system;
pub use self::system::*;
