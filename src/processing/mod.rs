pub mod csv_writer;
pub mod restart;
pub mod series;
pub mod summary;
