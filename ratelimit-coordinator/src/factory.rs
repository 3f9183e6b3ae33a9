//! Factory entrypoint for building a coordinator. Used by the consumers
//! of this crate.

use crate::builders::coordinator::CoordinatorBuilder;

/// A factory used as the entrypoint for building a coordinator instance.
pub struct CoordinatorFactory;

impl CoordinatorFactory {
    /// Provides a builder for a coordinator.
    pub fn coordinator() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn factory_produces_a_usable_builder() {
        let coordinator = CoordinatorFactory::coordinator().build();
        assert!(coordinator.is_ok());
    }
}
