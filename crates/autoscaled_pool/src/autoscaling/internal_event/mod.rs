//! Metrics and structured log events emitted by the pool and the snapshotter.
//!
//! Each event registers its metric handles once and is then emitted many times
//! through the returned handle.

mod autoscaling;

pub use autoscaling::*;

/// Declares a registered event: a unit struct whose `register()` resolves metric
/// handles into a `<Name>Handle`, and an `emit` method on that handle.
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty)
        $emit_body:block
    ) => {
        ::paste::paste! {
            #[derive(Clone, Copy, Debug, Default)]
            pub struct $event;

            #[derive(Clone)]
            pub struct [<$event Handle>] {
                $( $field: $type, )*
            }

            impl $event {
                pub fn register(self) -> [<$event Handle>] {
                    [<$event Handle>] {
                        $( $field: $value, )*
                    }
                }
            }

            impl [<$event Handle>] {
                pub fn emit(&$slf, $data_name: $data) $emit_body
            }
        }
    };
}
