//! 每类资源一个强类型 handle，底层都是同一个 64 位 `Handle`

use crate::handle::handle_store::Handle;

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
            pub struct $name(pub(crate) Handle);

            impl $name {
                pub const NULL: $name = $name(Handle::NULL);

                #[inline]
                pub const fn from_raw(raw: u64) -> Self {
                    Self(Handle::from_raw(raw))
                }

                #[inline]
                pub const fn raw(self) -> u64 {
                    self.0.raw()
                }

                #[inline]
                pub const fn handle(self) -> Handle {
                    self.0
                }

                #[inline]
                pub const fn is_null(self) -> bool {
                    self.0.is_null()
                }
            }
        )*
    };
}

define_handle! {
    /// 逻辑设备
    DeviceHandle;
    BufferHandle;
    ImageHandle;
    ShaderHandle;
    /// compute pipeline，连同其 layout 与 descriptor set
    PipelineHandle;
    CommandBufferHandle;
    FenceHandle;
}
