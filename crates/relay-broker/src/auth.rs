/// Logon gatekeeper. Called at most once per session, on its LOGON record;
/// a `false` verdict shuts the session down.
pub trait Authenticator: Send {
    fn authenticate(&self, client_type: u32, client_id: u32, payload: &[u8]) -> bool;
}

/// Accepts every logon. The default until a real scheme is plugged in.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _client_type: u32, _client_id: u32, _payload: &[u8]) -> bool {
        true
    }
}
