mod analyses;
mod files;
mod pool;
mod sync;
