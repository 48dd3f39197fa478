pub mod api_server;
pub mod bus;
pub mod context;
pub mod core;
pub mod decision;
pub mod intent;
pub mod io;
pub mod memory;
pub mod rules;
pub mod scenario;
pub mod trace;
pub mod workflow;
