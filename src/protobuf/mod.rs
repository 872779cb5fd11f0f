//! Generated protobuf modules
//!
//! `build.rs` compiles every `.proto` under `protos/meshtastic/`; prost emits one
//! file per package (`meshtastic.rs`), which is included here.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes because only part of the
    //! generated API is used by the gateway.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    // Generated docs can contain tag-like text; relax strict rustdoc HTML checks here
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
