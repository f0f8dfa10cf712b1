pub mod buildsystem;
pub mod command;
pub mod db;
mod densemap;
pub mod depfile;
pub mod engine;
pub mod fileinfo;
pub mod graph;
pub mod hash;
pub mod key;
pub mod manifest;
pub mod queue;
pub mod run;
mod scanner;
mod smallmap;
pub mod tools;
pub mod trace;
pub mod value;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
