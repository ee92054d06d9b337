pub mod cmd;
pub mod replay;
