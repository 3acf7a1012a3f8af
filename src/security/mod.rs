pub mod allowed_dirs;
pub mod command_gate;
