//! Turns loaded modules into a populated [`CapabilityTable`].

use tracing::{debug, error};

use super::capability::{Capability, CapabilityTable, Feature, Requirement, Slot};
use super::locator::{Located, LoadedModule};
use crate::errors::LoadFailure;

// -----------------------------------------------------------------------------
// ----- Resolver --------------------------------------------------------------

/// Resolve every capability in [`Capability::ALL`] order, trying each name
/// variant across all modules (crypto first, then tls) and stopping at the
/// first hit.
pub fn resolve(located: &Located) -> Result<CapabilityTable, LoadFailure> {
    if located.modules.is_empty() {
        error!("no ssl runtime module found");
        return Err(LoadFailure::NoModules {
            tried: located.tried.clone(),
        });
    }

    let mut table = CapabilityTable::empty();

    for capability in Capability::ALL {
        match find(&located.modules, capability) {
            Some(slot) => table.set(capability, slot),
            None => match capability.requirement() {
                Requirement::Mandatory => {
                    error!("mandatory ssl symbol {capability} not found");
                    return Err(LoadFailure::MandatorySymbolMissing {
                        capability,
                        names: capability.names().to_vec(),
                    });
                }
                Requirement::Optional => {
                    debug!("optional ssl symbol {capability} not available");
                }
            },
        }
    }

    for feature in Feature::ALL {
        if !table.feature_available(feature) {
            error!("ssl runtime offers no usable {feature}");
            return Err(LoadFailure::FeatureMissing { feature });
        }
    }

    Ok(table)
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn find(modules: &[LoadedModule], capability: Capability) -> Option<Slot> {
    for name in capability.names() {
        for (position, loaded) in modules.iter().enumerate() {
            if let Some(symbol) = loaded.module.symbol(name) {
                return Some(Slot::Resolved {
                    symbol,
                    name,
                    module: position,
                });
            }
        }
    }
    None
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
