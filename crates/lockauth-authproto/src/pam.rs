//! Linux-PAM backend.
//!
//! A thin binding of the handful of libpam calls the checker needs. The
//! conversation callback forwards every PAM message batch to the shared
//! [`Converser`], which relays it to the UI process.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString, NulError};
use std::ptr;

use lockauth_core::checker::{ConverseError, Converser, SharedConverser, Step, StepKind};
use lockauth_core::{AuthBackend, AuthStatus, Identity};
use secrecy::ExposeSecret;
use tracing::{debug, error, warn};

// Return codes (Linux-PAM numbering).
const PAM_SUCCESS: c_int = 0;
const PAM_SERVICE_ERR: c_int = 3;
const PAM_BUF_ERR: c_int = 5;
const PAM_PERM_DENIED: c_int = 6;
const PAM_AUTH_ERR: c_int = 7;
const PAM_USER_UNKNOWN: c_int = 10;
const PAM_MAXTRIES: c_int = 11;
const PAM_NEW_AUTHTOK_REQD: c_int = 12;
const PAM_ACCT_EXPIRED: c_int = 13;
const PAM_CONV_ERR: c_int = 19;
const PAM_ABORT: c_int = 26;

// Items.
const PAM_TTY: c_int = 3;
const PAM_RHOST: c_int = 4;
const PAM_RUSER: c_int = 8;

// Message styles.
const PAM_PROMPT_ECHO_OFF: c_int = 1;
const PAM_PROMPT_ECHO_ON: c_int = 2;
const PAM_ERROR_MSG: c_int = 3;
const PAM_TEXT_INFO: c_int = 4;

const PAM_CHANGE_EXPIRED_AUTHTOK: c_int = 0x0020;

#[repr(C)]
struct PamHandle {
    _private: [u8; 0],
}

#[repr(C)]
struct PamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct PamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

type ConvFn = extern "C" fn(c_int, *mut *const PamMessage, *mut *mut PamResponse, *mut c_void) -> c_int;

#[repr(C)]
struct PamConv {
    conv: Option<ConvFn>,
    appdata_ptr: *mut c_void,
}

#[link(name = "pam")]
extern "C" {
    fn pam_start(
        service_name: *const c_char,
        user: *const c_char,
        pam_conversation: *const PamConv,
        pamh: *mut *mut PamHandle,
    ) -> c_int;
    fn pam_end(pamh: *mut PamHandle, pam_status: c_int) -> c_int;
    fn pam_authenticate(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_acct_mgmt(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_chauthtok(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_set_item(pamh: *mut PamHandle, item_type: c_int, item: *const c_void) -> c_int;
    fn pam_strerror(pamh: *mut PamHandle, errnum: c_int) -> *const c_char;
}

fn status_from_code(code: c_int) -> AuthStatus {
    match code {
        PAM_SUCCESS => AuthStatus::Success,
        PAM_ABORT => AuthStatus::Abort,
        PAM_MAXTRIES => AuthStatus::MaxAttemptsReached,
        PAM_NEW_AUTHTOK_REQD => AuthStatus::CredentialExpired,
        PAM_AUTH_ERR => AuthStatus::AuthFailed,
        PAM_CONV_ERR => AuthStatus::ConversationFailed,
        PAM_USER_UNKNOWN => AuthStatus::UserUnknown,
        PAM_ACCT_EXPIRED => AuthStatus::AccountExpired,
        PAM_PERM_DENIED => AuthStatus::PermissionDenied,
        PAM_SERVICE_ERR => AuthStatus::ServiceError,
        other => AuthStatus::Other(other),
    }
}

fn code_from_status(status: AuthStatus) -> c_int {
    match status {
        AuthStatus::Success => PAM_SUCCESS,
        AuthStatus::Abort => PAM_ABORT,
        AuthStatus::MaxAttemptsReached => PAM_MAXTRIES,
        AuthStatus::CredentialExpired => PAM_NEW_AUTHTOK_REQD,
        AuthStatus::AuthFailed => PAM_AUTH_ERR,
        AuthStatus::ConversationFailed => PAM_CONV_ERR,
        AuthStatus::UserUnknown => PAM_USER_UNKNOWN,
        AuthStatus::AccountExpired => PAM_ACCT_EXPIRED,
        AuthStatus::PermissionDenied => PAM_PERM_DENIED,
        AuthStatus::ServiceError => PAM_SERVICE_ERR,
        AuthStatus::Other(code) => code,
    }
}

fn step_kind(style: c_int) -> StepKind {
    match style {
        PAM_PROMPT_ECHO_OFF => StepKind::PromptHidden,
        PAM_PROMPT_ECHO_ON => StepKind::PromptEcho,
        PAM_ERROR_MSG => StepKind::ErrorAlert,
        PAM_TEXT_INFO => StepKind::InfoAlert,
        other => StepKind::Unsupported(other),
    }
}

/// Wipe and free the first `count` replies and the array itself.
///
/// # Safety
///
/// `replies` must come from `calloc` with at least `count` entries whose
/// `resp` fields are null or NUL-terminated `malloc` allocations.
unsafe fn free_replies(replies: *mut PamResponse, count: usize) {
    for i in 0..count {
        let reply = &mut *replies.add(i);
        if !reply.resp.is_null() {
            let len = libc::strlen(reply.resp);
            ptr::write_bytes(reply.resp, 0, len);
            libc::free(reply.resp.cast());
            reply.resp = ptr::null_mut();
        }
    }
    libc::free(replies.cast());
}

/// The PAM conversation callback.
///
/// `appdata` points at the `RefCell<Converser>` inside a [`SharedConverser`]
/// kept alive by the [`PamBackend`].
extern "C" fn converse(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata.is_null() {
        return PAM_CONV_ERR;
    }
    let count = num_msg as usize;

    // SAFETY: appdata was set from a live SharedConverser in PamBackend::start.
    let converser = unsafe { &*(appdata as *const RefCell<Converser>) };
    let Ok(mut converser) = converser.try_borrow_mut() else {
        error!("Conversation callback entered while the converser is busy");
        return PAM_CONV_ERR;
    };

    let mut steps = Vec::with_capacity(count);
    for i in 0..count {
        // SAFETY: PAM passes `num_msg` valid message pointers.
        let message = unsafe { &**msg.add(i) };
        let text: &[u8] = if message.msg.is_null() {
            b""
        } else {
            // SAFETY: PAM messages are NUL-terminated strings.
            unsafe { CStr::from_ptr(message.msg) }.to_bytes()
        };
        steps.push(Step::new(step_kind(message.msg_style), text));
    }

    let answers = match converser.converse(&steps) {
        Ok(answers) => answers,
        Err(ConverseError::Reentered) => std::process::exit(1),
        Err(e) => {
            debug!(error = %e, "Conversation failed");
            return PAM_CONV_ERR;
        }
    };

    // PAM frees the replies with free(), so they must come from malloc.
    // SAFETY: plain allocation; checked for null below.
    let replies = unsafe { libc::calloc(count, std::mem::size_of::<PamResponse>()) }.cast::<PamResponse>();
    if replies.is_null() {
        return PAM_BUF_ERR;
    }
    for (i, answer) in answers.into_iter().enumerate() {
        let Some(secret) = answer else { continue };
        let bytes = secret.expose_secret();
        // SAFETY: allocation of len + 1 bytes, checked for null.
        let copy = unsafe { libc::malloc(bytes.len() + 1) }.cast::<c_char>();
        if copy.is_null() {
            // SAFETY: replies came from calloc and holds `count` entries.
            unsafe { free_replies(replies, count) };
            return PAM_BUF_ERR;
        }
        // SAFETY: copy has room for the bytes and the terminator.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), copy.cast::<u8>(), bytes.len());
            *copy.add(bytes.len()) = 0;
            (*replies.add(i)).resp = copy;
        }
    }

    // SAFETY: resp was checked for null above.
    unsafe { *resp = replies };
    PAM_SUCCESS
}

/// Authenticates through a PAM service.
pub struct PamBackend {
    service: CString,
    converser: SharedConverser,
    conv: Box<PamConv>,
    handle: *mut PamHandle,
}

impl PamBackend {
    /// A backend for `service` talking to the user through `converser`.
    pub fn new(service: &str, converser: SharedConverser) -> Result<Self, NulError> {
        let appdata = std::rc::Rc::as_ptr(&converser) as *mut c_void;
        Ok(Self {
            service: CString::new(service)?,
            converser,
            conv: Box::new(PamConv {
                conv: Some(converse),
                appdata_ptr: appdata,
            }),
            handle: ptr::null_mut(),
        })
    }
}

/// PAM items describing where the user authenticates from.
///
/// Without a display the terminal item is set to null.
fn session_items(identity: &Identity) -> [(c_int, &'static str, Option<&str>); 3] {
    [
        (PAM_RHOST, "rhost", Some(identity.host.as_str())),
        (PAM_RUSER, "ruser", Some(identity.user.as_str())),
        (PAM_TTY, "tty", identity.tty.as_deref()),
    ]
}

/// Hand each item to `set` in order, stopping at the first failure.
fn set_items<F>(items: &[(c_int, &str, Option<&str>)], mut set: F) -> AuthStatus
where
    F: FnMut(c_int, *const c_void) -> c_int,
{
    for &(item, name, value) in items {
        let value = match value.map(CString::new).transpose() {
            Ok(value) => value,
            Err(_) => {
                error!(item = name, "PAM item contains a NUL byte");
                return AuthStatus::ServiceError;
            }
        };
        let ptr = value.as_ref().map_or(ptr::null(), |v| v.as_ptr().cast());
        let code = set(item, ptr);
        if code != PAM_SUCCESS {
            warn!(item = name, code, "Failed to set PAM item");
            return status_from_code(code);
        }
    }
    AuthStatus::Success
}

impl AuthBackend for PamBackend {
    fn start(&mut self, identity: &Identity) -> AuthStatus {
        let Ok(user) = CString::new(identity.user.as_str()) else {
            error!("User name contains a NUL byte");
            return AuthStatus::ServiceError;
        };
        // SAFETY: all pointers are valid for the call; the conv struct and
        // the converser it points to outlive the handle.
        let code = unsafe {
            pam_start(
                self.service.as_ptr(),
                user.as_ptr(),
                &*self.conv,
                &mut self.handle,
            )
        };
        if code != PAM_SUCCESS {
            return status_from_code(code);
        }

        let handle = self.handle;
        // SAFETY: the handle is live; PAM copies each string.
        let status = set_items(&session_items(identity), |item, value| unsafe {
            pam_set_item(handle, item, value)
        });
        if status != AuthStatus::Success {
            error!(reason = %self.describe(status), "Could not describe the session to PAM");
        }
        status
    }

    fn authenticate(&mut self) -> AuthStatus {
        // SAFETY: handle from a successful pam_start.
        status_from_code(unsafe { pam_authenticate(self.handle, 0) })
    }

    fn account_management(&mut self) -> AuthStatus {
        // SAFETY: handle from a successful pam_start.
        status_from_code(unsafe { pam_acct_mgmt(self.handle, 0) })
    }

    fn change_expired_credential(&mut self) -> AuthStatus {
        // SAFETY: handle from a successful pam_start.
        status_from_code(unsafe { pam_chauthtok(self.handle, PAM_CHANGE_EXPIRED_AUTHTOK) })
    }

    fn end(&mut self, status: AuthStatus) -> AuthStatus {
        if self.handle.is_null() {
            debug!("No PAM handle to close");
            return AuthStatus::Success;
        }
        // SAFETY: handle from pam_start; cleared so it is closed only once.
        let code = unsafe { pam_end(self.handle, code_from_status(status)) };
        self.handle = ptr::null_mut();
        status_from_code(code)
    }

    fn describe(&self, status: AuthStatus) -> String {
        // SAFETY: pam_strerror accepts any handle, including null, and
        // returns a static string.
        let text = unsafe { pam_strerror(self.handle, code_from_status(status)) };
        if text.is_null() {
            return status.to_string();
        }
        // SAFETY: non-null result of pam_strerror is NUL-terminated.
        unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
    }
}

impl Drop for PamBackend {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle from pam_start that end() never closed.
            unsafe { pam_end(self.handle, PAM_ABORT) };
            self.handle = ptr::null_mut();
        }
    }
}

impl std::fmt::Debug for PamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PamBackend")
            .field("service", &self.service)
            .field("open", &!self.handle.is_null())
            .field("converser", &self.converser)
            .finish()
    }
}
