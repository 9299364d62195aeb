pub mod export;
pub mod pipeline;
pub mod table;
pub mod treatment;
pub mod zonal_fold;
