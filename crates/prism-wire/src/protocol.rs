//! Built-in interfaces of the display protocol.
//!
//! The `display` singleton (always object id 1) and the `callback`
//! interface are frozen tables both endpoints hard-code; every other
//! interface is supplied by the application as static descriptors.

use crate::interface::{Interface, MessageDesc};

/// The display singleton always occupies this id on every connection.
pub const DISPLAY_OBJECT_ID: u32 = 1;

/// Request and event opcodes of the `display` interface.
pub mod display {
    pub const REQ_SYNC: u16 = 0;
    pub const REQ_FRAME: u16 = 1;
    pub const REQ_BIND: u16 = 2;

    pub const EVT_ERROR: u16 = 0;
    pub const EVT_GLOBAL: u16 = 1;
    pub const EVT_GLOBAL_REMOVE: u16 = 2;
    pub const EVT_DELETE_ID: u16 = 3;
    pub const EVT_RANGE: u16 = 4;
    pub const EVT_INVALID_OBJECT: u16 = 5;
    pub const EVT_INVALID_METHOD: u16 = 6;
    pub const EVT_NO_MEMORY: u16 = 7;
}

/// Event opcodes of the `callback` interface.
pub mod callback {
    pub const EVT_DONE: u16 = 0;
}

pub static DISPLAY_INTERFACE: Interface = Interface {
    name: "display",
    version: 1,
    requests: &[
        MessageDesc {
            name: "sync",
            signature: "n",
            child_interface: Some(&CALLBACK_INTERFACE),
        },
        MessageDesc {
            name: "frame",
            signature: "n",
            child_interface: Some(&CALLBACK_INTERFACE),
        },
        // The bound interface is named on the wire; the new id stays
        // untyped until the server resolves the global.
        MessageDesc {
            name: "bind",
            signature: "usun",
            child_interface: None,
        },
    ],
    events: &[
        MessageDesc {
            name: "error",
            signature: "ous",
            child_interface: None,
        },
        MessageDesc {
            name: "global",
            signature: "usu",
            child_interface: None,
        },
        MessageDesc {
            name: "global_remove",
            signature: "u",
            child_interface: None,
        },
        MessageDesc {
            name: "delete_id",
            signature: "u",
            child_interface: None,
        },
        MessageDesc {
            name: "range",
            signature: "u",
            child_interface: None,
        },
        MessageDesc {
            name: "invalid_object",
            signature: "u",
            child_interface: None,
        },
        MessageDesc {
            name: "invalid_method",
            signature: "uu",
            child_interface: None,
        },
        MessageDesc {
            name: "no_memory",
            signature: "",
            child_interface: None,
        },
    ],
};

pub static CALLBACK_INTERFACE: Interface = Interface {
    name: "callback",
    version: 1,
    requests: &[],
    events: &[MessageDesc {
        name: "done",
        signature: "u",
        child_interface: None,
    }],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgumentType;

    #[test]
    fn opcodes_match_table_order() {
        assert_eq!(
            DISPLAY_INTERFACE.requests[display::REQ_SYNC as usize].name,
            "sync"
        );
        assert_eq!(
            DISPLAY_INTERFACE.requests[display::REQ_BIND as usize].name,
            "bind"
        );
        assert_eq!(
            DISPLAY_INTERFACE.events[display::EVT_DELETE_ID as usize].name,
            "delete_id"
        );
        assert_eq!(
            DISPLAY_INTERFACE.events[display::EVT_NO_MEMORY as usize].name,
            "no_memory"
        );
        assert_eq!(
            CALLBACK_INTERFACE.events[callback::EVT_DONE as usize].name,
            "done"
        );
    }

    #[test]
    fn signatures_use_known_codes_only() {
        let messages = DISPLAY_INTERFACE
            .requests
            .iter()
            .chain(DISPLAY_INTERFACE.events)
            .chain(CALLBACK_INTERFACE.events);
        for desc in messages {
            for code in desc.signature.chars() {
                assert!(
                    ArgumentType::from_code(code).is_some(),
                    "{}.{} has unknown code {code}",
                    DISPLAY_INTERFACE.name,
                    desc.name,
                );
            }
        }
    }

    #[test]
    fn sync_and_frame_create_callbacks() {
        for opcode in [display::REQ_SYNC, display::REQ_FRAME] {
            let desc = &DISPLAY_INTERFACE.requests[opcode as usize];
            let child = desc.child_interface.unwrap();
            assert!(crate::interface::same_interface(child, &CALLBACK_INTERFACE));
        }
    }
}
