//! Controller registry: one controller per site for the whole run.
//!
//! Controllers are created lazily on the first tick a site has work and
//! are never removed while the run lasts (except when a controller
//! panics, in which case it is discarded and rebuilt on the site's next
//! tick). The registry is owned by one coordinator; sibling federates each
//! have their own.
//!
//! # Concurrency precondition
//!
//! The registry is not synchronized. Concurrent dispatch stays correct
//! because each tick touches every site at most once: a controller is
//! [checked out](ControllerRegistry::check_out) for the duration of its
//! run, moved to the worker that runs it, and
//! [checked in](ControllerRegistry::check_in) after the barrier. Two
//! workers can never hold the same site because only one boxed controller
//! exists per site.

use std::collections::HashMap;
use std::sync::Arc;

use spm_types::{ControllerVariant, SiteId};
use tracing::debug;

use crate::controller::{ControllerFactory, SiteController};

/// Site-keyed store of controller instances.
pub struct ControllerRegistry {
    factory: Arc<dyn ControllerFactory>,
    controllers: HashMap<SiteId, Box<dyn SiteController>>,
}

impl ControllerRegistry {
    /// Create an empty registry that builds controllers with `factory`.
    pub fn new(factory: Arc<dyn ControllerFactory>) -> Self {
        Self {
            factory,
            controllers: HashMap::new(),
        }
    }

    /// Return the controller for `site_id`, creating it if needed.
    ///
    /// The variant is chosen by [`ControllerVariant::classify`].
    pub fn get_or_create(&mut self, site_id: &SiteId) -> &mut dyn SiteController {
        let factory = &self.factory;
        self.controllers
            .entry(site_id.clone())
            .or_insert_with(|| build(factory.as_ref(), site_id))
            .as_mut()
    }

    /// Return the controller for `site_id` if one exists.
    pub fn get(&self, site_id: &SiteId) -> Option<&dyn SiteController> {
        self.controllers.get(site_id).map(Box::as_ref)
    }

    /// Whether a controller exists for `site_id`.
    pub fn contains(&self, site_id: &SiteId) -> bool {
        self.controllers.contains_key(site_id)
    }

    /// Number of controllers created so far.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether no controller has been created yet.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Take ownership of the controller for `site_id`, creating it if
    /// needed. It must be returned with [`check_in`](Self::check_in).
    pub fn check_out(&mut self, site_id: &SiteId) -> Box<dyn SiteController> {
        self.controllers
            .remove(site_id)
            .unwrap_or_else(|| build(self.factory.as_ref(), site_id))
    }

    /// Return a controller previously taken with
    /// [`check_out`](Self::check_out).
    pub fn check_in(&mut self, controller: Box<dyn SiteController>) {
        self.controllers
            .insert(controller.site_id().clone(), controller);
    }
}

fn build(factory: &dyn ControllerFactory, site_id: &SiteId) -> Box<dyn SiteController> {
    let variant = ControllerVariant::classify(site_id);
    debug!(site_id = %site_id, variant = %variant, "creating site controller");
    factory.create(variant, site_id)
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("controllers", &self.controllers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use spm_types::ChargingEvent;

    use super::*;
    use crate::controller::BuiltinControllerFactory;

    fn registry() -> ControllerRegistry {
        ControllerRegistry::new(Arc::new(BuiltinControllerFactory::default()))
    }

    #[test]
    fn creates_variant_by_site_name() {
        let mut reg = registry();
        assert_eq!(
            reg.get_or_create(&SiteId::new("S1")).variant(),
            ControllerVariant::Default
        );
        assert_eq!(
            reg.get_or_create(&SiteId::new("Depot-2")).variant(),
            ControllerVariant::RideHail
        );
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut reg = registry();
        let site = SiteId::new("S1");
        let ran = reg
            .get_or_create(&site)
            .run(0, &[ChargingEvent::new("S1", "V1")]);
        assert!(ran.is_ok());

        // Same instance: the output from the first run is still there.
        assert_eq!(reg.get_or_create(&site).output_from_latest_run().len(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn check_out_and_in_preserves_state() {
        let mut reg = registry();
        let site = SiteId::new("S1");
        let mut controller = reg.check_out(&site);
        assert!(!reg.contains(&site));
        assert!(controller.run(0, &[ChargingEvent::new("S1", "V1")]).is_ok());
        reg.check_in(controller);

        assert!(reg.contains(&site));
        assert_eq!(
            reg.get(&site).map(|c| c.output_from_latest_run().len()),
            Some(1)
        );
    }
}
