//! Low-level building blocks shared by the storage and log layers.

pub mod io;
