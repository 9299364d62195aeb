pub mod overlap;
pub mod polygon_layer;
pub mod raster;
pub mod reclassify;
pub mod zonal;
