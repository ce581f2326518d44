//! CLI subcommands

pub mod checkpoints;
pub mod evictions;
pub mod recommend;
