//! Macros for declaring packet keys.

/// Declare one or more well-known [`Key`](crate::Key) constants.
///
/// Each key names the packet slot and fixes the type stored in it. Keys are
/// meant to be process-wide constants; two keys sharing a name but not a
/// type never see each other's values.
///
/// # Example
///
/// ```
/// use keelson::{packet_key, Packet};
///
/// packet_key! {
///     /// Pods created so far in this run.
///     pub PODS_CREATED: u32 = "podsCreated";
///     SERVICE_NAME: String = "serviceName";
/// }
///
/// let mut packet = Packet::new();
/// packet.insert(PODS_CREATED, 2);
/// assert_eq!(packet.get(PODS_CREATED), Some(&2));
/// assert!(packet.get(SERVICE_NAME).is_none());
/// ```
#[macro_export]
macro_rules! packet_key {
    ($($(#[$meta:meta])* $vis:vis $ident:ident: $ty:ty = $name:literal;)+) => {
        $(
            $(#[$meta])*
            $vis const $ident: $crate::Key<$ty> = $crate::Key::new($name);
        )+
    };
}
