extern crate rand;
#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate rayon;

extern crate byteorder;
extern crate image;

#[macro_use]
extern crate log;

pub mod forest;

pub mod pipeline;
pub mod types;
