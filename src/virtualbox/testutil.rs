//! Scripted stand-in for every collaborator of the driver. Each call is
//! checked against the next expected signature, in order.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::virtualbox::disk::{DiskCreator, SshKeyGenerator};
use crate::virtualbox::driver::{IpWaiter, VirtualBoxDriver};
use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::host_ifaces::{HostInterface, HostInterfaces};
use crate::virtualbox::iso::IsoCache;
use crate::virtualbox::models::VmDescriptor;
use crate::virtualbox::ssh::{SshRunner, SshTarget};
use crate::virtualbox::util::{RandomInter, Sleeper};
use crate::virtualbox::vbm::{VBoxManager, VBoxOutput};
use crate::virtualbox::vtx::{LogsReader, VirtualizationCheck};

/// Matches any call.
pub(crate) const IGNORE_CALL: &str = "IGNORE CALL";
/// Placeholder inside a signature that matches any text.
pub(crate) const ANY: &str = "{any}";

struct Call {
    signature: String,
    output: String,
    stderr: String,
    err: Option<VBoxError>,
}

pub(crate) struct MockOperations {
    expected: Mutex<VecDeque<Call>>,
    seen: Mutex<Vec<String>>,
    host_ifaces: Vec<HostInterface>,
    random: u32,
}

/// A VBoxManage failure carrying `stderr`.
pub(crate) fn vbm_error(stderr: &str) -> VBoxError {
    VBoxError::Command {
        command: "VBoxManage".to_string(),
        stderr: stderr.to_string(),
    }
}

fn matches_signature(expected: &str, actual: &str) -> bool {
    if expected == IGNORE_CALL {
        return true;
    }
    match expected.split_once(ANY) {
        Some((prefix, suffix)) => {
            actual.len() >= prefix.len() + suffix.len()
                && actual.starts_with(prefix)
                && actual.ends_with(suffix)
        }
        None => expected == actual,
    }
}

impl MockOperations {
    pub(crate) fn new() -> Self {
        Self {
            expected: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            host_ifaces: Vec::new(),
            // random_int(24) + 1 lands on .6
            random: 5,
        }
    }

    pub(crate) fn expect(
        self,
        signature: &str,
        output: &str,
        stderr: &str,
        err: Option<VBoxError>,
    ) -> Self {
        self.expected.lock().unwrap().push_back(Call {
            signature: signature.to_string(),
            output: output.to_string(),
            stderr: stderr.to_string(),
            err,
        });
        self
    }

    pub(crate) fn with_host_interfaces(mut self, ifaces: Vec<HostInterface>) -> Self {
        self.host_ifaces = ifaces;
        self
    }

    /// Every call made so far, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    /// Fail the test if expected calls were never made.
    pub(crate) fn finish(&self) {
        let left: Vec<String> = self
            .expected
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.signature.clone())
            .collect();
        assert!(left.is_empty(), "expected calls never made: {left:#?}");
    }

    fn do_call(&self, signature: String) -> (String, String, Option<VBoxError>) {
        let call = self.expected.lock().unwrap().pop_front();
        let Some(call) = call else {
            panic!("Unexpected call {signature:?}, after {:#?}", self.calls());
        };
        assert!(
            matches_signature(&call.signature, &signature),
            "Unexpected call {signature:?}, expected {:?}",
            call.signature
        );
        self.seen.lock().unwrap().push(signature);
        (call.output, call.stderr, call.err)
    }

    fn do_simple(&self, signature: String) -> Result<String> {
        let (output, _, err) = self.do_call(signature);
        match err {
            Some(e) => Err(e),
            None => Ok(output),
        }
    }
}

/// A driver for `default` under `/t` with every collaborator replaced by `mock`.
pub(crate) fn mocked_driver(mock: &Arc<MockOperations>) -> VirtualBoxDriver {
    let mut config = VmDescriptor::new("default", "/t");
    config.boot2docker_url = "http://b2d.org".to_string();
    mocked_driver_with(config, mock)
}

pub(crate) fn mocked_driver_with(
    config: VmDescriptor,
    mock: &Arc<MockOperations>,
) -> VirtualBoxDriver {
    VirtualBoxDriver::new(config)
        .unwrap()
        .with_vbox(mock.clone())
        .with_host_interfaces(mock.clone())
        .with_iso_cache(mock.clone())
        .with_ssh_key_generator(mock.clone())
        .with_disk_creator(mock.clone())
        .with_logs_reader(mock.clone())
        .with_ip_waiter(mock.clone())
        .with_random(mock.clone())
        .with_sleeper(mock.clone())
        .with_ssh_runner(mock.clone())
        .with_virtualization_check(mock.clone())
}

#[async_trait]
impl VBoxManager for MockOperations {
    async fn vbm_out_err(&self, args: &[&str]) -> Result<VBoxOutput> {
        let (stdout, stderr, err) = self.do_call(format!("vbm {}", args.join(" ")));
        match err {
            Some(e) => Err(e),
            None => Ok(VBoxOutput { stdout, stderr }),
        }
    }
}

#[async_trait]
impl Sleeper for MockOperations {
    async fn sleep(&self, d: Duration) {
        let signature = if d.subsec_nanos() == 0 {
            format!("Sleep {}s", d.as_secs())
        } else {
            format!("Sleep {d:?}")
        };
        self.do_call(signature);
    }
}

impl RandomInter for MockOperations {
    fn random_int(&self, n: u32) -> u32 {
        self.random.min(n.saturating_sub(1))
    }
}

impl HostInterfaces for MockOperations {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        self.do_simple("Interfaces".to_string())?;
        Ok(self.host_ifaces.clone())
    }
}

#[async_trait]
impl IsoCache for MockOperations {
    async fn update_iso_cache(&self, store_path: &Path, iso_url: &str) -> Result<()> {
        self.do_simple(format!("UpdateISOCache {} {}", store_path.display(), iso_url))
            .map(|_| ())
    }

    async fn copy_iso_to_machine_dir(
        &self,
        store_path: &Path,
        machine_name: &str,
        iso_url: &str,
    ) -> Result<()> {
        self.do_simple(format!(
            "CopyIsoToMachineDir {} {} {}",
            store_path.display(),
            machine_name,
            iso_url
        ))
        .map(|_| ())
    }
}

#[async_trait]
impl SshKeyGenerator for MockOperations {
    async fn generate(&self, path: &Path) -> Result<()> {
        self.do_simple(format!("Generate {}", path.display())).map(|_| ())
    }
}

#[async_trait]
impl DiskCreator for MockOperations {
    async fn create(&self, size_mb: u64, public_key: &Path, _raw: &Path, disk: &Path) -> Result<()> {
        self.do_simple(format!(
            "Create {} {} {}",
            size_mb,
            public_key.display(),
            disk.display()
        ))
        .map(|_| ())
    }
}

impl LogsReader for MockOperations {
    fn read(&self, path: &Path) -> Result<Vec<String>> {
        let out = self.do_simple(format!("Read {}", path.display()))?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl IpWaiter for MockOperations {
    async fn wait(&self, _driver: &VirtualBoxDriver) -> Result<String> {
        self.do_simple("WaitIP".to_string())
    }
}

#[async_trait]
impl SshRunner for MockOperations {
    async fn run(&self, _target: &SshTarget, command: &str) -> Result<String> {
        self.do_simple(format!("SSH {command}"))
    }
}

#[async_trait]
impl VirtualizationCheck for MockOperations {
    async fn is_vtx_disabled(&self) -> bool {
        self.do_simple("IsVTXDisabled".to_string())
            .map(|out| out == "true")
            .unwrap_or(false)
    }

    async fn is_hyperv_installed(&self) -> bool {
        self.do_simple("IsHyperVInstalled".to_string())
            .map(|out| out == "true")
            .unwrap_or(false)
    }
}

#[test]
fn signature_placeholders() {
    assert!(matches_signature("vbm a {any} c", "vbm a 50022 c"));
    assert!(!matches_signature("vbm a {any} c", "vbm b 50022 c"));
    assert!(matches_signature(IGNORE_CALL, "anything"));
    assert!(matches_signature("exact", "exact"));
}
