pub mod clock;
pub mod config;
pub mod controller;
pub mod gate;
pub mod injector;
pub mod parameters;
pub mod reconciler;
pub mod store;

pub mod consts {
    pub const NAME: &str = "catalog-controller";
}
