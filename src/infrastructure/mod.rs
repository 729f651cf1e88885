pub mod bluetooth;
pub mod input_simulator;
pub mod logging;
pub mod timer;
