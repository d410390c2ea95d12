//! Auxiliary records attached to buffers.

use std::any::Any;
use std::fmt;

/// Type-erasure helper so attached metadata can be downcast.
///
/// Implemented automatically for every `'static` type.
pub trait MetaAny {
    /// Returns `self` as [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> MetaAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A metadata record that can be attached to a [`Buffer`](crate::Buffer).
///
/// Records are shared (`Arc<dyn Meta>`): attaching takes a reference and
/// removing releases it, so the same record may sit on several buffers.
///
/// # Example
///
/// ```
/// use stream_media::{Buffer, Meta};
/// use std::sync::Arc;
///
/// #[derive(Debug)]
/// struct VolumeMeta {
///     gain_db: f32,
/// }
///
/// impl Meta for VolumeMeta {}
///
/// let mut buffer = Buffer::from_vec(vec![0; 64]);
/// buffer.add_meta(Arc::new(VolumeMeta { gain_db: -6.0 }));
/// assert_eq!(buffer.first_meta::<VolumeMeta>().map(|m| m.gain_db), Some(-6.0));
/// ```
pub trait Meta: MetaAny + fmt::Debug + Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Downcasts a type-erased meta to `T`.
pub(crate) fn downcast_meta<T: Meta + 'static>(meta: &dyn Meta) -> Option<&T> {
    meta.as_any().downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker(u32);

    impl Meta for Marker {}

    #[derive(Debug)]
    struct Other;

    impl Meta for Other {}

    #[test]
    fn test_downcast_matching_type() {
        let meta: Box<dyn Meta> = Box::new(Marker(7));
        assert_eq!(downcast_meta::<Marker>(meta.as_ref()).map(|m| m.0), Some(7));
    }

    #[test]
    fn test_downcast_other_type() {
        let meta: Box<dyn Meta> = Box::new(Other);
        assert!(downcast_meta::<Marker>(meta.as_ref()).is_none());
    }

    #[test]
    fn test_default_name() {
        let meta = Marker(1);
        assert!(meta.name().ends_with("Marker"));
    }
}
