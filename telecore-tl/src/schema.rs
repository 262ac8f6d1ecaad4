//! Constructor ids from the application schema that the session engine
//! needs to recognise without decoding the payload.

/// Schema layer announced through `invokeWithLayer`.
pub const LAYER: i32 = 224;

pub const INVOKE_WITH_LAYER: u32 = 0xda9b0d0d;
pub const INIT_CONNECTION: u32 = 0xc1cd5ea9;
/// `help.getConfig#c4f9186b = Config`, the usual `initConnection` query.
pub const HELP_GET_CONFIG: u32 = 0xc4f9186b;

// ─── auth ────────────────────────────────────────────────────────────────────

pub const AUTH_IMPORT_LOGIN_TOKEN: u32 = 0x95ac5ce4;
pub const AUTH_EXPORT_LOGIN_TOKEN: u32 = 0xb7e085fe;
pub const ACCOUNT_GET_PASSWORD: u32 = 0x548a30f5;
pub const AUTH_CHECK_PASSWORD: u32 = 0xd18b4d16;

pub const AUTH_AUTHORIZATION: u32 = 0x2ea2c0d4;
pub const AUTH_LOGIN_TOKEN_SUCCESS: u32 = 0x390d5c5e;
pub const AUTH_SENT_CODE_SUCCESS: u32 = 0x2390fe44;

/// Methods that may be sent while the connection is not yet authorized.
pub fn is_auth_method(id: u32) -> bool {
    matches!(
        id,
        AUTH_IMPORT_LOGIN_TOKEN | AUTH_EXPORT_LOGIN_TOKEN | ACCOUNT_GET_PASSWORD | AUTH_CHECK_PASSWORD
    )
}

/// Results that turn an unauthorized connection into an authorized one.
pub fn is_auth_success(id: u32) -> bool {
    matches!(id, AUTH_AUTHORIZATION | AUTH_LOGIN_TOKEN_SUCCESS | AUTH_SENT_CODE_SUCCESS)
}

// ─── updates ─────────────────────────────────────────────────────────────────

pub const UPDATES_TOO_LONG: u32 = 0xe317af7e;
pub const UPDATE_SHORT_MESSAGE: u32 = 0x313bc7f8;
pub const UPDATE_SHORT_CHAT_MESSAGE: u32 = 0x4d6deea5;
pub const UPDATE_SHORT: u32 = 0x78d4dec1;
pub const UPDATES_COMBINED: u32 = 0x725b04c3;
pub const UPDATES: u32 = 0x74ae4240;
pub const UPDATE_SHORT_SENT_MESSAGE: u32 = 0x9015e101;

/// Constructors of the boxed `Updates` type, pushed by the server outside
/// of any `rpc_result`.
pub fn is_updates(id: u32) -> bool {
    matches!(
        id,
        UPDATES_TOO_LONG
            | UPDATE_SHORT_MESSAGE
            | UPDATE_SHORT_CHAT_MESSAGE
            | UPDATE_SHORT
            | UPDATES_COMBINED
            | UPDATES
            | UPDATE_SHORT_SENT_MESSAGE
    )
}
