//! InMemoryObjectStore - object store for tests and dry runs.
//!
//! Behaves like a small multi-account blob service:
//! - delegation keys are random and remembered per account
//! - server-side copies only succeed with a valid SAS for the source object
//! - copies can be scripted to stay pending, fail, or never finish
//! - copy starts and status reads can be scripted to fail
//!
//! Everything lives behind one `std::sync::Mutex` that is never held across
//! an `.await`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use tracing::debug;
use url::Url;

use super::sas::{SAS_VERSION, UserDelegationSigner};
use crate::domain::{
    AccountName, ContainerHandle, ContainerName, CopyHandle, CopyStatus, CopyStatusReport,
    DelegationCredential, DelegationKey, ObjectIdentity, Permission, StoreError, ValidityWindow,
};
use crate::ports::{Clock, DelegationIssuer, ObjectStore};

const HOST_SUFFIX: &str = ".blob.memory.test";

/// How a started copy behaves when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyBehavior {
    /// Finished by the time the start call returns.
    Immediate,
    /// Reports `pending` for this many polls, then `success`.
    PendingFor(u32),
    /// Never leaves `pending`.
    StuckPending,
    /// Ends in the given status (after one pending poll).
    EndsWith {
        status: CopyStatus,
        description: String,
    },
}

/// Scripted faults for one account.
#[derive(Debug, Default)]
struct Faults {
    /// Consumed one per copy-start call.
    copy_start: VecDeque<StoreError>,
    /// Returned on every copy-start call.
    copy_start_always: Option<StoreError>,
    /// Consumed one per status read.
    status_read: VecDeque<StoreError>,
    /// Returned by `create_container_if_absent`.
    create_container: Option<StoreError>,
    /// Per object name; missing entries use `default_copy`.
    copy_behavior: HashMap<String, CopyBehavior>,
    default_copy: Option<CopyBehavior>,
}

#[derive(Debug)]
struct CopyProgress {
    copy_id: String,
    status: CopyStatus,
    description: Option<String>,
    /// `None` means the copy stays pending forever.
    pending_polls_left: Option<u32>,
    final_status: CopyStatus,
    payload: Bytes,
}

#[derive(Debug)]
struct StoredObject {
    bytes: Bytes,
    copy: Option<CopyProgress>,
}

#[derive(Debug, Default)]
struct AccountState {
    containers: BTreeMap<ContainerName, BTreeMap<String, StoredObject>>,
    can_delegate: bool,
    issued_keys: Vec<DelegationKey>,
    faults: Faults,
    copy_start_calls: u32,
    status_reads: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct StoreState {
    accounts: HashMap<AccountName, AccountState>,
    delegations_issued: u32,
    delegation_faults: VecDeque<StoreError>,
    next_copy_id: u64,
}

impl StoreState {
    fn account_mut(
        &mut self,
        account: &AccountName,
        auto_create: bool,
    ) -> Result<&mut AccountState, StoreError> {
        if auto_create {
            return Ok(self
                .accounts
                .entry(account.clone())
                .or_insert_with(|| AccountState {
                    can_delegate: true,
                    ..AccountState::default()
                }));
        }
        self.accounts
            .get_mut(account)
            .ok_or_else(|| StoreError::NotFound(format!("account `{account}`")))
    }
}

/// In-memory multi-account blob store.
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    signer: UserDelegationSigner,
    auto_create_accounts: bool,
}

impl InMemoryObjectStore {
    /// Store where only accounts added with [`Self::add_account`] exist.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            signer: UserDelegationSigner::new(),
            auto_create_accounts: false,
        }
    }

    /// Store that creates any account on first use (dry runs).
    pub fn with_auto_accounts(clock: Arc<dyn Clock>) -> Self {
        Self {
            auto_create_accounts: true,
            ..Self::new(clock)
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_account(&self, account: &AccountName) {
        self.lock().accounts.entry(account.clone()).or_insert_with(|| AccountState {
            can_delegate: true,
            ..AccountState::default()
        });
    }

    /// Accounts without delegation rights answer `Unauthorized`.
    pub fn deny_delegation(&self, account: &AccountName) {
        self.add_account(account);
        if let Some(state) = self.lock().accounts.get_mut(account) {
            state.can_delegate = false;
        }
    }

    /// Fail the next delegation requests with these errors, in order.
    pub fn fail_next_delegations(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.lock().delegation_faults.extend(errors);
    }

    /// Fail the next copy starts on `account` with these errors, in order.
    pub fn fail_next_copy_starts(
        &self,
        account: &AccountName,
        errors: impl IntoIterator<Item = StoreError>,
    ) {
        self.with_faults(account, |f| f.copy_start.extend(errors));
    }

    /// Fail every copy start on `account`.
    pub fn fail_all_copy_starts(&self, account: &AccountName, error: StoreError) {
        self.with_faults(account, |f| f.copy_start_always = Some(error));
    }

    /// Fail the next status reads on `account` with these errors, in order.
    pub fn fail_next_status_reads(
        &self,
        account: &AccountName,
        errors: impl IntoIterator<Item = StoreError>,
    ) {
        self.with_faults(account, |f| f.status_read.extend(errors));
    }

    pub fn fail_container_creation(&self, account: &AccountName, error: StoreError) {
        self.with_faults(account, |f| f.create_container = Some(error));
    }

    /// Script how copies of `object_name` into `account` behave.
    pub fn script_copy(&self, account: &AccountName, object_name: &str, behavior: CopyBehavior) {
        self.with_faults(account, |f| {
            f.copy_behavior.insert(object_name.to_string(), behavior);
        });
    }

    /// Default behavior for copies into `account`.
    pub fn script_default_copy(&self, account: &AccountName, behavior: CopyBehavior) {
        self.with_faults(account, |f| f.default_copy = Some(behavior));
    }

    fn with_faults(&self, account: &AccountName, apply: impl FnOnce(&mut Faults)) {
        self.add_account(account);
        if let Some(state) = self.lock().accounts.get_mut(account) {
            apply(&mut state.faults);
        }
    }

    /// Current content of an object, if it exists and is not mid-copy.
    pub fn object_bytes(
        &self,
        account: &AccountName,
        container: &ContainerName,
        name: &str,
    ) -> Option<Bytes> {
        let state = self.lock();
        let object = state.accounts.get(account)?.containers.get(container)?.get(name)?;
        match &object.copy {
            Some(copy) if copy.status != CopyStatus::Success => None,
            _ => Some(object.bytes.clone()),
        }
    }

    pub fn container_exists(&self, account: &AccountName, container: &ContainerName) -> bool {
        self.lock()
            .accounts
            .get(account)
            .is_some_and(|a| a.containers.contains_key(container))
    }

    pub fn delegations_issued(&self) -> u32 {
        self.lock().delegations_issued
    }

    pub fn copy_start_calls(&self, account: &AccountName) -> u32 {
        self.lock()
            .accounts
            .get(account)
            .map_or(0, |a| a.copy_start_calls)
    }

    pub fn status_reads(&self, account: &AccountName, object_name: &str) -> u32 {
        self.lock()
            .accounts
            .get(account)
            .and_then(|a| a.status_reads.get(object_name).copied())
            .unwrap_or(0)
    }

    /// Map a URL produced by [`ObjectStore::object_url`] back to an identity.
    fn parse_object_url(url: &Url) -> Result<ObjectIdentity, StoreError> {
        let invalid = || StoreError::InvalidInput(format!("not an object url: {url}"));
        let host = url.host_str().ok_or_else(invalid)?;
        let account = host.strip_suffix(HOST_SUFFIX).ok_or_else(invalid)?;
        let mut segments = url.path_segments().ok_or_else(invalid)?;
        let container = segments.next().ok_or_else(invalid)?;
        let name = segments
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let account = AccountName::new(account).map_err(|_| invalid())?;
        let container = ContainerName::new(container).map_err(|_| invalid())?;
        ObjectIdentity::new(account, container, name).map_err(|_| invalid())
    }

    fn behavior_for(faults: &Faults, name: &str) -> CopyBehavior {
        faults
            .copy_behavior
            .get(name)
            .or(faults.default_copy.as_ref())
            .cloned()
            .unwrap_or(CopyBehavior::PendingFor(1))
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn create_container_if_absent(
        &self,
        account: &AccountName,
        container: &ContainerName,
    ) -> Result<ContainerHandle, StoreError> {
        let mut state = self.lock();
        let account_state = state.account_mut(account, self.auto_create_accounts)?;
        if let Some(err) = account_state.faults.create_container.clone() {
            return Err(err);
        }
        account_state
            .containers
            .entry(container.clone())
            .or_default();
        Ok(ContainerHandle::new(account.clone(), container.clone()))
    }

    async fn list_objects(
        &self,
        container: &ContainerHandle,
    ) -> Result<Vec<ObjectIdentity>, StoreError> {
        let state = self.lock();
        let objects = state
            .accounts
            .get(&container.account)
            .and_then(|a| a.containers.get(&container.container))
            .ok_or_else(|| StoreError::NotFound(format!("container {container}")))?;
        objects
            .keys()
            .map(|name| {
                container
                    .object(name.clone())
                    .map_err(|e| StoreError::Other(e.to_string()))
            })
            .collect()
    }

    async fn put_object(
        &self,
        container: &ContainerHandle,
        name: &str,
        bytes: Bytes,
    ) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidInput("empty object name".into()));
        }
        let mut state = self.lock();
        let objects = state
            .accounts
            .get_mut(&container.account)
            .and_then(|a| a.containers.get_mut(&container.container))
            .ok_or_else(|| StoreError::NotFound(format!("container {container}")))?;
        objects.insert(name.to_string(), StoredObject { bytes, copy: None });
        Ok(())
    }

    fn object_url(&self, object: &ObjectIdentity) -> Result<Url, StoreError> {
        let mut url = Url::parse(&format!("https://{}{HOST_SUFFIX}/", object.account))
            .map_err(|e| StoreError::InvalidInput(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidInput("cannot-be-a-base url".into()))?
            .pop_if_empty()
            .push(object.container.as_str())
            .extend(object.name.split('/'));
        Ok(url)
    }

    async fn start_server_side_copy(
        &self,
        destination: &ContainerHandle,
        name: &str,
        source_url: &Url,
    ) -> Result<(CopyHandle, Option<CopyStatusReport>), StoreError> {
        let now = self.clock.now();
        let source = Self::parse_object_url(source_url)?;
        let mut state = self.lock();
        state.next_copy_id += 1;
        let copy_id = format!("copy-{}", state.next_copy_id);

        let dest_state = state.account_mut(&destination.account, self.auto_create_accounts)?;
        dest_state.copy_start_calls += 1;
        if let Some(err) = dest_state.faults.copy_start.pop_front() {
            return Err(err);
        }
        if let Some(err) = dest_state.faults.copy_start_always.clone() {
            return Err(err);
        }
        if !dest_state.containers.contains_key(&destination.container) {
            return Err(StoreError::NotFound(format!("container {destination}")));
        }
        let behavior = Self::behavior_for(&dest_state.faults, name);

        // the capability check happens on the source side
        let source_state = state
            .accounts
            .get(&source.account)
            .ok_or_else(|| StoreError::NotFound(format!("account `{}`", source.account)))?;
        let query = source_url
            .query()
            .ok_or_else(|| StoreError::Unauthorized("copy source has no token".into()))?;
        let verified = source_state
            .issued_keys
            .iter()
            .map(|key| {
                self.signer
                    .verify(key, &source, query, Permission::Read, now)
            })
            .collect::<Vec<_>>();
        if !verified.iter().any(Result::is_ok) {
            let reason = verified
                .into_iter()
                .find_map(Result::err)
                .map_or_else(|| "no delegation key issued".to_string(), |e| e.to_string());
            return Err(StoreError::Unauthorized(format!(
                "cannot verify copy source: {reason}"
            )));
        }
        let payload = source_state
            .containers
            .get(&source.container)
            .and_then(|c| c.get(&source.name))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(format!("copy source {source}")))?;

        let (status, pending_polls_left, final_status, description) = match behavior {
            CopyBehavior::Immediate => (CopyStatus::Success, Some(0), CopyStatus::Success, None),
            CopyBehavior::PendingFor(n) => (CopyStatus::Pending, Some(n), CopyStatus::Success, None),
            CopyBehavior::StuckPending => (CopyStatus::Pending, None, CopyStatus::Success, None),
            CopyBehavior::EndsWith {
                status,
                description,
            } => (CopyStatus::Pending, Some(1), status, Some(description)),
        };
        let bytes = if status == CopyStatus::Success {
            payload.clone()
        } else {
            Bytes::new()
        };

        let dest_state = state.account_mut(&destination.account, false)?;
        let objects = dest_state
            .containers
            .get_mut(&destination.container)
            .ok_or_else(|| StoreError::NotFound(format!("container {destination}")))?;
        objects.insert(
            name.to_string(),
            StoredObject {
                bytes,
                copy: Some(CopyProgress {
                    copy_id: copy_id.clone(),
                    status: status.clone(),
                    description,
                    pending_polls_left,
                    final_status,
                    payload,
                }),
            },
        );
        debug!(%destination, name, %copy_id, status = %status, "memory copy started");

        Ok((
            CopyHandle {
                destination: destination.clone(),
                object_name: name.to_string(),
                copy_id: Some(copy_id),
            },
            Some(CopyStatusReport::new(status)),
        ))
    }

    async fn get_copy_status(&self, handle: &CopyHandle) -> Result<CopyStatusReport, StoreError> {
        let mut state = self.lock();
        let account = state.account_mut(&handle.destination.account, false)?;
        *account
            .status_reads
            .entry(handle.object_name.clone())
            .or_default() += 1;
        if let Some(err) = account.faults.status_read.pop_front() {
            return Err(err);
        }
        let object = account
            .containers
            .get_mut(&handle.destination.container)
            .and_then(|c| c.get_mut(&handle.object_name))
            .ok_or_else(|| {
                StoreError::NotFound(format!("{}/{}", handle.destination, handle.object_name))
            })?;
        let copy = object
            .copy
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(format!("no copy on {}", handle.object_name)))?;
        if handle.copy_id.is_some() && handle.copy_id.as_deref() != Some(copy.copy_id.as_str()) {
            // a newer copy replaced the one this handle refers to
            return Ok(CopyStatusReport::new(CopyStatus::Aborted)
                .with_description("superseded by a newer copy"));
        }

        if copy.status == CopyStatus::Pending {
            match copy.pending_polls_left {
                Some(0) => {
                    copy.status = copy.final_status.clone();
                    if copy.status == CopyStatus::Success {
                        object.bytes = copy.payload.clone();
                    }
                }
                Some(n) => copy.pending_polls_left = Some(n - 1),
                None => {}
            }
        }

        let report = CopyStatusReport::new(copy.status.clone());
        Ok(match &copy.description {
            Some(description) if copy.status != CopyStatus::Pending => {
                report.with_description(description.clone())
            }
            _ => report,
        })
    }
}

#[async_trait]
impl DelegationIssuer for InMemoryObjectStore {
    async fn mint_delegation(
        &self,
        account: &AccountName,
        window: ValidityWindow,
    ) -> Result<DelegationCredential, StoreError> {
        let mut state = self.lock();
        if let Some(err) = state.delegation_faults.pop_front() {
            return Err(err);
        }
        let account_state = state.account_mut(account, self.auto_create_accounts)?;
        if !account_state.can_delegate {
            return Err(StoreError::Unauthorized(format!(
                "identity may not delegate on `{account}`"
            )));
        }
        let secret: [u8; 32] = rand::random();
        let key = DelegationKey {
            signed_oid: format!("oid-{}", ulid::Ulid::new()),
            signed_tid: "memory-tenant".to_string(),
            signed_start: window.start,
            signed_expiry: window.end,
            signed_service: "b".to_string(),
            signed_version: SAS_VERSION.to_string(),
            value: BASE64_STANDARD.encode(secret),
        };
        account_state.issued_keys.push(key.clone());
        state.delegations_issued += 1;
        Ok(DelegationCredential {
            account: account.clone(),
            window,
            key,
        })
    }
}
