pub mod binding;
pub mod broker;
pub mod class;
pub mod condition;
pub mod finalizer;
pub mod instance;
pub mod properties;

pub mod consts {
    pub const GROUP: &str = "servicecatalog.k8s.io";

    /// Finalizer token owned by the catalog controller.
    pub const FINALIZER_NAME: &str = "kubernetes-incubator/service-catalog";
}
