pub use crate::blueprint::{to_realm, to_realm_with, use_realm};
pub use crate::cell::Cell;
pub use crate::context::{ContextKey, UserContext, create_context, user_context};
pub use crate::effect::{AbortSignal, EffectScope, effect, set_effect_error_hook};
pub use crate::error::{Error, Result};
pub use crate::hooks::{
    guard, iterable, timeout, to_store, use_cell, use_effect, use_guard, use_iterable, use_never,
    use_portal, use_store, use_timeout,
};
pub use crate::portal::{PortalSetter, portal};
pub use crate::realm::{Observer, Realm};
pub use crate::resource::{Collector, ReleaseFuture, Resource};
pub use crate::store::Store;
