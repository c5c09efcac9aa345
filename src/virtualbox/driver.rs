use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::virtualbox::disk::{DiskCreator, SshKeyGenerator, SshKeygen, VBoxDiskCreator};
use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::host_ifaces::{validate_no_ip_collisions, HostInterfaces, SystemHostInterfaces};
use crate::virtualbox::iso::{B2dIsoCache, IsoCache};
use crate::virtualbox::models::{
    DhcpServer, HostOnlyNetwork, PortForward, VirtualDisk, VmDescriptor, VmInfo, VmState,
    DEFAULT_HOST_ONLY_CIDR, DEFAULT_SSH_USER,
};
use crate::virtualbox::nat::set_port_forwarding;
use crate::virtualbox::network::{
    add_host_only_dhcp_server, dhcp_address_range, get_host_only_adapter,
    get_or_create_host_only_network, list_host_only_adapters, parse_and_validate_cidr,
    random_ip_in_subnet, remove_orphan_dhcp_servers,
};
use crate::virtualbox::parse::{
    is_machine_not_found, parse_key_values, RE_EQUAL_LINE, RE_EQUAL_QUOTE_LINE,
};
use crate::virtualbox::ssh::{wait_for_ssh, SshRunner, SshTarget, SystemSshRunner};
use crate::virtualbox::util::{home_dir, RandomInter, Sleeper, ThreadRandom, TokioSleeper};
use crate::virtualbox::vbm::{VBoxCmdManager, VBoxManager};
use crate::virtualbox::version::check_vboxmanage;
use crate::virtualbox::vtx::{
    is_vtx_disabled_in_log, FileLogsReader, HostVirtualizationCheck, LogsReader,
    VirtualizationCheck,
};

pub const DRIVER_NAME: &str = "virtualbox";
pub const SSH_HOSTNAME: &str = "127.0.0.1";
pub const DOCKER_PORT: u16 = 2376;

const MAX_CPUS: i32 = 32;
const IP_ATTEMPTS: usize = 5;
const IP_INTERVAL: Duration = Duration::from_secs(4);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ADAPTER_SETTLE: Duration = Duration::from_secs(5);

static RE_VM_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^VMState="(\w+)""#).expect("valid regex"));
static RE_HOST_ONLY_ADAPTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^hostonlyadapter(\d+)").expect("valid regex"));

/// Waits for a freshly started VM to get an address on its host-only network.
#[async_trait]
pub trait IpWaiter: Send + Sync {
    async fn wait(&self, driver: &VirtualBoxDriver) -> Result<String>;
}

/// Waits for sshd over the NAT forward, then for DHCP on the host-only NIC.
pub struct SshIpWaiter;

#[async_trait]
impl IpWaiter for SshIpWaiter {
    async fn wait(&self, driver: &VirtualBoxDriver) -> Result<String> {
        wait_for_ssh(&*driver.ssh_runner, &*driver.sleeper, &driver.ssh_target()).await?;

        for _ in 0..IP_ATTEMPTS {
            match driver.get_ip().await {
                Ok(ip) if !ip.is_empty() => {
                    debug!("IP is {}", ip);
                    return Ok(ip);
                }
                Ok(_) => debug!(
                    "Strangely, there was no error attempting to get the IP, but it was still empty."
                ),
                Err(e) => debug!("ERROR getting IP: {}", e),
            }
            driver.sleeper.sleep(IP_INTERVAL).await;
        }

        Err(VBoxError::IpUnavailable)
    }
}

/// Drives one VirtualBox VM through its lifecycle by shelling out to
/// VBoxManage. Not meant to be shared between concurrent operations on the
/// same machine.
pub struct VirtualBoxDriver {
    config: VmDescriptor,
    vbox: Arc<dyn VBoxManager>,
    host_interfaces: Arc<dyn HostInterfaces>,
    iso_cache: Arc<dyn IsoCache>,
    ssh_key_generator: Arc<dyn SshKeyGenerator>,
    disk_creator: Arc<dyn DiskCreator>,
    logs_reader: Arc<dyn LogsReader>,
    ip_waiter: Arc<dyn IpWaiter>,
    random: Arc<dyn RandomInter>,
    sleeper: Arc<dyn Sleeper>,
    ssh_runner: Arc<dyn SshRunner>,
    virt_check: Arc<dyn VirtualizationCheck>,
}

impl VirtualBoxDriver {
    pub fn new(config: VmDescriptor) -> Result<Self> {
        let vbox: Arc<dyn VBoxManager> = Arc::new(VBoxCmdManager::new());

        Ok(Self {
            config,
            disk_creator: Arc::new(VBoxDiskCreator::new(vbox.clone())),
            vbox,
            host_interfaces: Arc::new(SystemHostInterfaces),
            iso_cache: Arc::new(B2dIsoCache::new()?),
            ssh_key_generator: Arc::new(SshKeygen),
            logs_reader: Arc::new(FileLogsReader),
            ip_waiter: Arc::new(SshIpWaiter),
            random: Arc::new(ThreadRandom),
            sleeper: Arc::new(TokioSleeper),
            ssh_runner: Arc::new(SystemSshRunner),
            virt_check: Arc::new(HostVirtualizationCheck),
        })
    }

    /// Also rebinds the default disk creator to `vbox`.
    pub fn with_vbox(mut self, vbox: Arc<dyn VBoxManager>) -> Self {
        self.disk_creator = Arc::new(VBoxDiskCreator::new(vbox.clone()));
        self.vbox = vbox;
        self
    }

    pub fn with_host_interfaces(mut self, host_interfaces: Arc<dyn HostInterfaces>) -> Self {
        self.host_interfaces = host_interfaces;
        self
    }

    pub fn with_iso_cache(mut self, iso_cache: Arc<dyn IsoCache>) -> Self {
        self.iso_cache = iso_cache;
        self
    }

    pub fn with_ssh_key_generator(mut self, generator: Arc<dyn SshKeyGenerator>) -> Self {
        self.ssh_key_generator = generator;
        self
    }

    pub fn with_disk_creator(mut self, disk_creator: Arc<dyn DiskCreator>) -> Self {
        self.disk_creator = disk_creator;
        self
    }

    pub fn with_logs_reader(mut self, logs_reader: Arc<dyn LogsReader>) -> Self {
        self.logs_reader = logs_reader;
        self
    }

    pub fn with_ip_waiter(mut self, ip_waiter: Arc<dyn IpWaiter>) -> Self {
        self.ip_waiter = ip_waiter;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomInter>) -> Self {
        self.random = random;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_ssh_runner(mut self, ssh_runner: Arc<dyn SshRunner>) -> Self {
        self.ssh_runner = ssh_runner;
        self
    }

    pub fn with_virtualization_check(mut self, virt_check: Arc<dyn VirtualizationCheck>) -> Self {
        self.virt_check = virt_check;
        self
    }

    pub fn config(&self) -> &VmDescriptor {
        &self.config
    }

    pub fn into_config(self) -> VmDescriptor {
        self.config
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn ssh_hostname(&self) -> &'static str {
        SSH_HOSTNAME
    }

    pub fn ssh_username(&self) -> &str {
        if self.config.ssh_user.is_empty() {
            DEFAULT_SSH_USER
        } else {
            &self.config.ssh_user
        }
    }

    pub fn ssh_port(&self) -> u16 {
        self.config.ssh_port
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.config.ssh_key_path()
    }

    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: SSH_HOSTNAME.to_string(),
            port: self.config.ssh_port,
            user: self.ssh_username().to_string(),
            key_path: self.ssh_key_path(),
        }
    }

    fn machine_name(&self) -> &str {
        &self.config.machine_name
    }

    async fn vbm(&self, args: &[&str]) -> Result<()> {
        self.vbox.vbm(args).await
    }

    /// Everything that can be verified before touching VirtualBox state.
    pub async fn pre_create_check(&self) -> Result<()> {
        let version = check_vboxmanage(&*self.vbox).await?;
        debug!("VBoxManage version {}", version);

        if !self.config.no_vtx_check {
            if self.virt_check.is_hyperv_installed().await {
                return Err(VBoxError::HyperVConflict);
            }

            if self.virt_check.is_vtx_disabled().await {
                return Err(VBoxError::VtxDisabled);
            }
        }

        // Fetch the ISO now so a download failure can't leave a half-created machine.
        self.iso_cache
            .update_iso_cache(&self.config.store_path, &self.config.boot2docker_url)
            .await?;

        list_host_only_adapters(&*self.vbox).await?;

        Ok(())
    }

    pub async fn create(&mut self) -> Result<()> {
        self.create_vm().await?;

        info!("Starting the VM...");
        self.start().await
    }

    pub async fn create_vm(&mut self) -> Result<()> {
        self.iso_cache
            .copy_iso_to_machine_dir(
                &self.config.store_path,
                &self.config.machine_name,
                &self.config.boot2docker_url,
            )
            .await?;

        info!("Creating VirtualBox VM...");

        match self.config.boot2docker_import_vm.clone() {
            Some(import) if !import.is_empty() => self.import_boot2docker_vm(&import).await?,
            _ => {
                info!("Creating SSH key...");
                self.ssh_key_generator
                    .generate(&self.config.ssh_key_path())
                    .await?;

                debug!("Creating disk image...");
                self.disk_creator
                    .create(
                        self.config.disk_size,
                        &self.config.public_ssh_key_path(),
                        &self.config.raw_disk_path(),
                        &self.config.disk_path(),
                    )
                    .await?;
            }
        }

        let name = self.machine_name().to_string();
        let base_folder = self.config.machine_dir().to_string_lossy().to_string();
        self.vbm(&["createvm", "--basefolder", &base_folder, "--name", &name, "--register"])
            .await?;

        debug!("VM CPUS: {}", self.config.cpu);
        debug!("VM Memory: {}", self.config.memory);

        let flags = vm_modify_flags(&self.config);
        let mut modify = vec!["modifyvm", name.as_str()];
        modify.extend(flags.iter().map(String::as_str));
        self.vbm(&modify).await?;

        self.vbm(&[
            "modifyvm",
            &name,
            "--nic1",
            "nat",
            "--nictype1",
            &self.config.nat_nic_type,
            "--cableconnected1",
            "on",
        ])
        .await?;

        self.vbm(&["storagectl", &name, "--name", "SATA", "--add", "sata", "--hostiocache", "on"])
            .await?;

        let iso = self.config.iso_path().to_string_lossy().to_string();
        self.vbm(&[
            "storageattach", &name, "--storagectl", "SATA", "--port", "0", "--device", "0",
            "--type", "dvddrive", "--medium", &iso,
        ])
        .await?;

        let disk = self.config.disk_path().to_string_lossy().to_string();
        self.vbm(&[
            "storageattach", &name, "--storagectl", "SATA", "--port", "1", "--device", "0",
            "--type", "hdd", "--medium", &disk,
        ])
        .await?;

        // Lets VBoxService automount shares at the guest root.
        self.vbm(&["guestproperty", "set", &name, "/VirtualBox/GuestAdd/SharedFolders/MountPrefix", "/"])
            .await?;
        self.vbm(&["guestproperty", "set", &name, "/VirtualBox/GuestAdd/SharedFolders/MountDir", "/"])
            .await?;

        self.setup_share_folder().await
    }

    async fn import_boot2docker_vm(&mut self, import: &str) -> Result<()> {
        // Best effort; the source VM may already be off.
        let _ = self.vbm(&["controlvm", import, "poweroff"]).await;

        let disk_info = get_vm_disk_info(import, &*self.vbox).await?;
        std::fs::metadata(&disk_info.path)?;

        let disk = self.config.disk_path().to_string_lossy().to_string();
        self.vbm(&["clonehd", &disk_info.path, &disk]).await?;

        debug!("Importing VM settings...");
        let vm_info = get_vm_info(import, &*self.vbox).await?;
        self.config.cpu = vm_info.cpus;
        self.config.memory = vm_info.memory;

        debug!("Importing SSH key...");
        let key = home_dir().join(".ssh").join("id_boot2docker");
        std::fs::copy(&key, self.config.ssh_key_path())?;

        Ok(())
    }

    async fn setup_share_folder(&self) -> Result<()> {
        let (mut share_dir, mut share_name) = {
            let (name, dir) = default_share();
            (dir.to_string(), name.to_string())
        };

        if let Some(folder) = self.config.share_folder.as_deref().filter(|f| !f.is_empty()) {
            let (dir, name) = parse_share_folder(folder);
            share_dir = dir.to_string();
            share_name = name.to_string();
        }

        if share_dir.is_empty() || self.config.no_share {
            return Ok(());
        }

        debug!("setting up shareDir '{}' -> '{}'", share_dir, share_name);
        match std::fs::metadata(&share_dir) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if share_name.is_empty() {
            // VirtualBox mishandles share names with a leading '/'.
            share_name = share_dir.trim_start_matches('/').to_string();
        }

        let name = self.machine_name();
        self.vbm(&["sharedfolder", "add", name, "--name", &share_name, "--hostpath", &share_dir, "--automount"])
            .await?;

        let symlinks = format!("VBoxInternal2/SharedFoldersEnableSymlinksCreate/{share_name}");
        self.vbm(&["setextradata", name, &symlinks, "1"]).await
    }

    pub async fn start(&mut self) -> Result<()> {
        let state = self.get_state().await?;

        let mut host_only_adapter = None;
        if matches!(state, VmState::Stopped | VmState::Saved) {
            info!("Check network to re-create if needed...");
            host_only_adapter = Some(
                self.setup_host_only_network(state == VmState::Stopped)
                    .await?,
            );
        }

        let name = self.machine_name().to_string();
        let ui_type = self.config.ui_type.as_str();

        match state {
            VmState::Stopped | VmState::Saved => {
                let ssh = PortForward {
                    name: "ssh".to_string(),
                    protocol: "tcp".to_string(),
                    host_port: self.config.ssh_port,
                    guest_port: 22,
                    interface: 1,
                };
                self.config.ssh_port = set_port_forwarding(&*self.vbox, &name, &ssh).await?;

                if let Err(e) = self.vbm(&["startvm", &name, "--type", ui_type]).await {
                    return Err(self.start_failure(e));
                }
            }
            VmState::Paused => {
                self.vbm(&["controlvm", &name, "resume", "--type", ui_type])
                    .await?;
                info!("Resuming VM ...");
            }
            _ => info!("VM not in restartable state"),
        }

        if !self.config.no_vtx_check && self.is_vtx_disabled_in_the_vm()? {
            return Err(VBoxError::VtxDisabled);
        }

        info!("Waiting for an IP...");
        self.config.ip_address = self.ip_waiter.wait(self).await?;

        let Some(host_only_adapter) = host_only_adapter else {
            return Ok(());
        };

        // Some VirtualBox releases wipe the adapter's address once the VM uses it.
        let nets = list_host_only_adapters(&*self.vbox).await?;
        let network = parse_and_validate_cidr(self.host_only_cidr())?;
        validate_no_ip_collisions(&*self.host_interfaces, network, &nets)?;

        if get_host_only_adapter(&nets, network.ip(), network.mask()).is_some() {
            return Ok(());
        }

        warn!("The host-only adapter is corrupted. Let's stop the VM, fix the host-only adapter and restart the VM");
        self.stop().await?;

        // The adapter can't be reconfigured while the VM still holds it.
        self.sleeper.sleep(ADAPTER_SETTLE).await;

        debug!("Fixing {:?}...", host_only_adapter);
        host_only_adapter.save_ipv4(&*self.vbox).await?;

        self.sleeper.sleep(ADAPTER_SETTLE).await;

        if let Err(e) = self.vbm(&["startvm", &name, "--type", ui_type]).await {
            return Err(VBoxError::StartFailed {
                reason: e.to_string(),
                details: None,
            });
        }

        info!("Waiting for an IP...");
        self.config.ip_address = self.ip_waiter.wait(self).await?;

        Ok(())
    }

    fn start_failure(&self, err: VBoxError) -> VBoxError {
        let details = self
            .read_vbox_log()
            .ok()
            .and_then(|lines| lines.last().cloned());

        VBoxError::StartFailed {
            reason: err.to_string(),
            details,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        let name = self.machine_name().to_string();
        let state = self.get_state().await?;

        if state == VmState::Stopped {
            info!("VM {} is already stopped", name);
            self.config.ip_address.clear();
            return Ok(());
        }

        if state == VmState::Paused {
            self.vbm(&["controlvm", &name, "resume"]).await?;
            info!("Resuming VM ...");
        }

        self.vbm(&["controlvm", &name, "acpipowerbutton"]).await?;

        while self.get_state().await? == VmState::Running {
            self.sleeper.sleep(STOP_POLL_INTERVAL).await;
        }

        self.config.ip_address.clear();
        Ok(())
    }

    /// Stop then start a machine known to be running.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.start().await?;

        self.config.ip_address.clear();
        self.config.ip_address = self.ip_waiter.wait(self).await?;
        Ok(())
    }

    pub async fn kill(&self) -> Result<()> {
        self.vbm(&["controlvm", self.machine_name(), "poweroff"])
            .await
    }

    /// Unregister the VM and delete its files. A machine VirtualBox does not
    /// know about counts as already removed.
    pub async fn remove(&self) -> Result<()> {
        let state = match self.get_state().await {
            Err(VBoxError::MachineNotExist) => return Ok(()),
            other => other?,
        };

        if state != VmState::Stopped && state != VmState::Saved {
            self.kill().await?;
        }

        self.vbm(&["unregistervm", "--delete", self.machine_name()])
            .await
    }

    pub async fn get_state(&self) -> Result<VmState> {
        let out = self
            .vbox
            .vbm_out_err(&["showvminfo", self.machine_name(), "--machinereadable"])
            .await
            .map_err(machine_not_exist)?;

        Ok(RE_VM_STATE
            .captures(&out.stdout)
            .map(|caps| VmState::from_vbox(&caps[1]))
            .unwrap_or(VmState::None))
    }

    /// Lower-cased MAC, without colons, of the first host-only NIC of the VM.
    pub async fn get_host_only_mac_address(&self) -> Result<String> {
        let out = self
            .vbox
            .vbm_out_err(&["showvminfo", self.machine_name(), "--machinereadable"])
            .await
            .map_err(machine_not_exist)?;

        let adapter = RE_HOST_ONLY_ADAPTER
            .captures_iter(&out.stdout)
            .filter_map(|caps| caps[1].parse::<u32>().ok())
            .min()
            .ok_or(VBoxError::NoHostOnlyAdapter)?;

        let re = Regex::new(&format!(r#"(?m)^macaddress{adapter}="(.*)""#))
            .map_err(|e| VBoxError::Parse(e.to_string()))?;
        let caps = re
            .captures(&out.stdout)
            .ok_or_else(|| VBoxError::MacAddressNotFound(adapter.to_string()))?;

        Ok(caps[1].to_lowercase().replace(':', ""))
    }

    pub async fn get_ip(&self) -> Result<String> {
        // Addresses come from DHCP, so a VM that isn't running has none.
        if self.get_state().await? != VmState::Running {
            return Err(VBoxError::HostNotRunning);
        }

        let mac = self.get_host_only_mac_address().await?;
        debug!("Host-only MAC: {}", mac);

        let output = self.ssh_runner.run(&self.ssh_target(), "ip addr show").await?;
        debug!("SSH returned: {}\nEND SSH", output);

        parse_ip_for_mac_from_ip_addr(&output, &mac)
    }

    pub async fn get_url(&self) -> Result<String> {
        let ip = self.get_ip().await?;
        if ip.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("tcp://{ip}:{DOCKER_PORT}"))
    }

    fn host_only_cidr(&self) -> &str {
        if self.config.host_only_cidr.is_empty() {
            DEFAULT_HOST_ONLY_CIDR
        } else {
            &self.config.host_only_cidr
        }
    }

    /// Find or create the host-only adapter for the configured CIDR and
    /// its DHCP server. With `attach_nic`, also plug it in as NIC 2.
    pub async fn setup_host_only_network(&self, attach_nic: bool) -> Result<HostOnlyNetwork> {
        let network = parse_and_validate_cidr(self.host_only_cidr())?;

        let nets = list_host_only_adapters(&*self.vbox).await?;
        validate_no_ip_collisions(&*self.host_interfaces, network, &nets)?;

        debug!(
            "Searching for hostonly interface for IPv4: {} and Mask: {}",
            network.ip(),
            network.mask()
        );
        let adapter = get_or_create_host_only_network(
            network.ip(),
            network.mask(),
            &nets,
            &*self.vbox,
            &*self.sleeper,
        )
        .await?;

        if let Err(e) = remove_orphan_dhcp_servers(&*self.vbox).await {
            warn!("Unable to remove orphan DHCP servers: {}", e);
        }

        let dhcp_addr = random_ip_in_subnet(&*self.random, network.ip(), network)?;
        let (lower_ip, upper_ip) = dhcp_address_range(dhcp_addr, network);

        debug!(
            "Adding/Modifying DHCP server {:?} with address range {:?} - {:?}...",
            dhcp_addr, lower_ip, upper_ip
        );

        let dhcp = DhcpServer {
            network_name: String::new(),
            ip: Some(dhcp_addr),
            netmask: Some(network.mask()),
            lower_ip: Some(lower_ip),
            upper_ip: Some(upper_ip),
            enabled: !self.config.host_only_no_dhcp,
        };
        add_host_only_dhcp_server(&adapter.name, &dhcp, &*self.vbox).await?;

        if attach_nic {
            self.vbm(&[
                "modifyvm",
                self.machine_name(),
                "--nic2",
                "hostonly",
                "--nictype2",
                &self.config.host_only_nic_type,
                "--nicpromisc2",
                &self.config.host_only_promisc_mode,
                "--hostonlyadapter2",
                &adapter.name,
                "--cableconnected2",
                "on",
            ])
            .await?;
        }

        Ok(adapter)
    }

    pub fn read_vbox_log(&self) -> Result<Vec<String>> {
        let path = self.config.vbox_log_path();
        debug!("Checking vm logs: {}", path.display());
        self.logs_reader.read(&path)
    }

    pub fn is_vtx_disabled_in_the_vm(&self) -> Result<bool> {
        Ok(is_vtx_disabled_in_log(&self.read_vbox_log()?))
    }
}

fn machine_not_exist(err: VBoxError) -> VBoxError {
    if err.stderr().is_some_and(is_machine_not_found) {
        VBoxError::MachineNotExist
    } else {
        err
    }
}

/// The `modifyvm` flags every new VM gets.
fn vm_modify_flags(config: &VmDescriptor) -> Vec<String> {
    let on_off = |b: bool| if b { "on" } else { "off" };

    let mut cpus = config.cpu;
    if cpus < 1 {
        cpus = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1);
    }
    let cpus = cpus.min(MAX_CPUS).to_string();
    let memory = config.memory.to_string();

    let mut flags = vec![
        "--firmware", "bios",
        "--bioslogofadein", "off",
        "--bioslogofadeout", "off",
        "--bioslogodisplaytime", "0",
        "--biosbootmenu", "disabled",
        "--ostype", "Linux26_64",
        "--cpus", cpus.as_str(),
        "--memory", memory.as_str(),
        "--acpi", "on",
        "--ioapic", "on",
        "--rtcuseutc", "on",
        "--natdnshostresolver1", on_off(config.host_dns_resolver),
        "--natdnsproxy1", on_off(config.dns_proxy),
        "--cpuhotplug", "off",
        "--pae", "on",
        "--hpet", "on",
        "--hwvirtex", "on",
        "--nestedpaging", "on",
        "--largepages", "on",
        "--vtxvpid", "on",
        "--accelerate3d", "off",
        "--boot1", "dvd",
    ];

    if cfg!(all(windows, target_arch = "x86")) {
        flags.extend(["--longmode", "on"]);
    }

    flags.into_iter().map(String::from).collect()
}

/// Host directory shared with every VM by default, as `(name, dir)`.
pub fn default_share() -> (&'static str, &'static str) {
    if cfg!(target_os = "macos") {
        ("Users", "/Users")
    } else if cfg!(target_os = "linux") {
        ("hosthome", "/home")
    } else if cfg!(windows) {
        ("c/Users", r"\\?\c:\Users")
    } else {
        ("", "")
    }
}

/// Split `dir:name` on its last colon, so Windows drive letters survive.
pub fn parse_share_folder(share_folder: &str) -> (&str, &str) {
    match share_folder.rsplit_once(':') {
        Some((dir, name)) => (dir, name),
        None => ("", share_folder),
    }
}

/// IPv4 address of the interface whose MAC (colons stripped) is `mac`, from
/// the output of `ip addr show` in the guest.
pub fn parse_ip_for_mac_from_ip_addr(ip_addr_output: &str, mac: &str) -> Result<String> {
    let mut in_device = false;

    for line in ip_addr_output.lines() {
        let line = line.trim();

        if line.starts_with("link") {
            if let Some(block) = line.split(' ').nth(1) {
                if block.replace(':', "") == mac {
                    in_device = true;
                }
            }
        } else if in_device && line.starts_with("inet") && !line.starts_with("inet6") {
            if let Some(cidr) = line.split(' ').nth(1) {
                let ip = cidr.split('/').next().unwrap_or(cidr);
                return Ok(ip.to_string());
            }
        }
    }

    Err(VBoxError::IpForMacNotFound(mac.to_string()))
}

/// Disk attached at SATA port 1 of an existing VM.
pub async fn get_vm_disk_info(name: &str, vbox: &dyn VBoxManager) -> Result<VirtualDisk> {
    let out = vbox
        .vbm_out(&["showvminfo", name, "--machinereadable"])
        .await?;

    let mut disk = VirtualDisk::default();
    parse_key_values(&out, &RE_EQUAL_QUOTE_LINE, |key, val| {
        match key {
            "SATA-1-0" => disk.path = val.to_string(),
            "SATA-ImageUUID-1-0" => disk.uuid = val.to_string(),
            _ => {}
        }
        Ok(())
    })?;

    Ok(disk)
}

pub async fn get_vm_info(name: &str, vbox: &dyn VBoxManager) -> Result<VmInfo> {
    let out = vbox
        .vbm_out(&["showvminfo", name, "--machinereadable"])
        .await?;

    let mut info = VmInfo::default();
    parse_key_values(&out, &RE_EQUAL_LINE, |key, val| {
        match key {
            "cpus" => {
                info.cpus = val
                    .parse()
                    .map_err(|_| VBoxError::Parse(format!("cpus={val}")))?
            }
            "memory" => {
                info.memory = val
                    .parse()
                    .map_err(|_| VBoxError::Parse(format!("memory={val}")))?
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtualbox::host_ifaces::HostInterface;
    use crate::virtualbox::testutil::{
        mocked_driver, mocked_driver_with, vbm_error, MockOperations, IGNORE_CALL,
    };

    const SHOWVMINFO: &str = "vbm showvminfo default --machinereadable";
    const ADAPTER: &str = "VirtualBox Host-Only Ethernet Adapter";

    fn adapter_listing(ip: &str) -> String {
        format!(
            "
Name:            VirtualBox Host-Only Ethernet Adapter
GUID:            786f6276-656e-4074-8000-0a0027000000
DHCP:            Disabled
IPAddress:       {ip}
NetworkMask:     255.255.255.0
IPV6Address:
IPV6NetworkMaskPrefixLength: 0
HardwareAddress: 0a:00:27:00:00:00
MediumType:      Ethernet
Status:          Up
VBoxNetworkName: HostInterfaceNetworking-VirtualBox Host-Only Ethernet Adapter"
        )
    }

    const MODIFY_VM: &str = "vbm modifyvm default --firmware bios --bioslogofadein off --bioslogofadeout off --bioslogodisplaytime 0 --biosbootmenu disabled --ostype Linux26_64 --cpus 1 --memory 1024 --acpi on --ioapic on --rtcuseutc on --natdnshostresolver1 off --natdnsproxy1 on --cpuhotplug off --pae on --hpet on --hwvirtex on --nestedpaging on --largepages on --vtxvpid on --accelerate3d off --boot1 dvd";

    fn modify_vm() -> String {
        if cfg!(all(windows, target_arch = "x86")) {
            format!("{MODIFY_VM} --longmode on")
        } else {
            MODIFY_VM.to_string()
        }
    }

    fn expect_network_setup(mock: MockOperations) -> MockOperations {
        mock.expect("vbm list hostonlyifs", "", "", None)
            .expect("Interfaces", "", "", None)
            .expect(
                "vbm hostonlyif create",
                &format!("Interface '{ADAPTER}' was successfully created"),
                "",
                None,
            )
            .expect("Sleep 1s", "", "", None)
            .expect("vbm list hostonlyifs", &adapter_listing("192.168.99.1"), "", None)
            .expect(
                &format!("vbm hostonlyif ipconfig {ADAPTER} --ip 192.168.99.1 --netmask 255.255.255.0"),
                "",
                "",
                None,
            )
            .expect("vbm list dhcpservers", "", "", None)
            .expect("vbm list dhcpservers", "", "", None)
            .expect(
                &format!("vbm dhcpserver add --netname HostInterfaceNetworking-{ADAPTER} --ip 192.168.99.6 --netmask 255.255.255.0 --lowerip 192.168.99.100 --upperip 192.168.99.254 --enable"),
                "",
                "",
                None,
            )
            .expect(
                &format!("vbm modifyvm default --nic2 hostonly --nictype2 82540EM --nicpromisc2 deny --hostonlyadapter2 {ADAPTER} --cableconnected2 on"),
                "",
                "",
                None,
            )
            .expect("vbm modifyvm default --natpf1 delete ssh", "", "", None)
            .expect("vbm modifyvm default --natpf1 ssh,tcp,127.0.0.1,{any},,22", "", "", None)
            .expect("vbm startvm default --type headless", "", "", None)
            .expect("Read /t/machines/default/default/Logs/VBox.log", "", "", None)
            .expect("WaitIP", "192.168.99.100", "", None)
    }

    #[test]
    fn metadata() {
        let mock = Arc::new(MockOperations::new());
        let driver = mocked_driver(&mock);

        assert_eq!(driver.driver_name(), "virtualbox");
        assert_eq!(driver.ssh_hostname(), "127.0.0.1");
        assert_eq!(driver.ssh_username(), "docker");
        assert_eq!(driver.ssh_key_path(), PathBuf::from("/t/machines/default/id_rsa"));
    }

    #[tokio::test]
    async fn state_from_showvminfo() {
        for (stdout, expected) in [
            (r#"VMState="running""#, VmState::Running),
            (r#"VMState="paused""#, VmState::Paused),
            (r#"VMState="saved""#, VmState::Saved),
            (r#"VMState="poweroff""#, VmState::Stopped),
            (r#"VMState="aborted""#, VmState::Stopped),
            (r#"VMState="whatever""#, VmState::None),
            ("unrelated=1\nVMState=\"running\"\nother=2", VmState::Running),
            ("", VmState::None),
        ] {
            let mock = Arc::new(MockOperations::new().expect(SHOWVMINFO, stdout, "", None));
            let driver = mocked_driver(&mock);
            assert_eq!(driver.get_state().await.unwrap(), expected, "{stdout}");
        }
    }

    #[tokio::test]
    async fn state_errors() {
        let mock = Arc::new(MockOperations::new().expect(
            SHOWVMINFO,
            "",
            "",
            Some(vbm_error(
                "VBoxManage: error: Could not find a registered machine named 'default'",
            )),
        ));
        let driver = mocked_driver(&mock);
        assert!(matches!(
            driver.get_state().await.unwrap_err(),
            VBoxError::MachineNotExist
        ));

        let mock = Arc::new(MockOperations::new().expect(
            SHOWVMINFO,
            "",
            "",
            Some(vbm_error("Unable to get state")),
        ));
        let driver = mocked_driver(&mock);
        assert_eq!(
            driver.get_state().await.unwrap_err().stderr(),
            Some("Unable to get state")
        );
    }

    #[tokio::test]
    async fn host_only_mac_address() {
        let mock = Arc::new(MockOperations::new().expect(
            SHOWVMINFO,
            "unrelatedfield=whatever\nhostonlyadapter2=\"vboxnet1\"\nmacaddress2=\"004488AABBCC\"\n",
            "",
            None,
        ));
        let driver = mocked_driver(&mock);
        assert_eq!(driver.get_host_only_mac_address().await.unwrap(), "004488aabbcc");

        let mock = Arc::new(MockOperations::new().expect(SHOWVMINFO, "unrelatedfield=whatever\n", "", None));
        let driver = mocked_driver(&mock);
        assert!(matches!(
            driver.get_host_only_mac_address().await.unwrap_err(),
            VBoxError::NoHostOnlyAdapter
        ));
    }

    #[tokio::test]
    async fn host_only_mac_uses_lowest_adapter() {
        let mock = Arc::new(MockOperations::new().expect(
            SHOWVMINFO,
            "hostonlyadapter3=\"vboxnet2\"\nmacaddress3=\"0800270000FF\"\nhostonlyadapter2=\"vboxnet1\"\nmacaddress2=\"08:00:27:AA:BB:CC\"\n",
            "",
            None,
        ));
        let driver = mocked_driver(&mock);
        assert_eq!(driver.get_host_only_mac_address().await.unwrap(), "080027aabbcc");
    }

    #[test]
    fn ip_for_mac_from_ip_addr() {
        let output = "1: eth0:\n    link/ether 00:44:88:aa:bb:cc\n    inet 1.2.3.4/24\n2: eth1:\n    link/ether 11:55:99:dd:ee:ff\n   inet 5.6.7.8/24";

        assert_eq!(parse_ip_for_mac_from_ip_addr(output, "004488aabbcc").unwrap(), "1.2.3.4");
        assert_eq!(parse_ip_for_mac_from_ip_addr(output, "115599ddeeff").unwrap(), "5.6.7.8");

        let err = parse_ip_for_mac_from_ip_addr(output, "000000000000").unwrap_err();
        assert_eq!(
            err.to_string(),
            VBoxError::IpForMacNotFound("000000000000".to_string()).to_string()
        );
    }

    #[test]
    fn ip_for_mac_skips_inet6() {
        let output = "2: eth1:\n    link/ether 08:00:27:aa:bb:cc brd ff:ff:ff:ff:ff:ff\n    inet6 fe80::a00:27ff/64 scope link\n    inet 192.168.99.100/24 brd 192.168.99.255";
        assert_eq!(
            parse_ip_for_mac_from_ip_addr(output, "080027aabbcc").unwrap(),
            "192.168.99.100"
        );
    }

    #[tokio::test]
    async fn ip_and_url_of_running_vm() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
                .expect(SHOWVMINFO, "hostonlyadapter2=\"vboxnet0\"\nmacaddress2=\"080027AABBCC\"", "", None)
                .expect(
                    "SSH ip addr show",
                    "2: eth1:\n    link/ether 08:00:27:aa:bb:cc\n    inet 192.168.99.100/24",
                    "",
                    None,
                )
                .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
                .expect(SHOWVMINFO, "hostonlyadapter2=\"vboxnet0\"\nmacaddress2=\"080027AABBCC\"", "", None)
                .expect(
                    "SSH ip addr show",
                    "2: eth1:\n    link/ether 08:00:27:aa:bb:cc\n    inet 192.168.99.100/24",
                    "",
                    None,
                ),
        );
        let driver = mocked_driver(&mock);

        assert_eq!(driver.get_ip().await.unwrap(), "192.168.99.100");
        assert_eq!(driver.get_url().await.unwrap(), "tcp://192.168.99.100:2376");
        mock.finish();
    }

    #[tokio::test]
    async fn ip_errors() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None)
                .expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None),
        );
        let driver = mocked_driver(&mock);
        assert!(matches!(driver.get_ip().await.unwrap_err(), VBoxError::HostNotRunning));
        assert!(matches!(driver.get_url().await.unwrap_err(), VBoxError::HostNotRunning));

        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, "", "", Some(vbm_error("Unable to get state")))
                .expect(SHOWVMINFO, "", "", Some(vbm_error("Unable to get state"))),
        );
        let driver = mocked_driver(&mock);
        assert_eq!(driver.get_ip().await.unwrap_err().stderr(), Some("Unable to get state"));
        assert_eq!(driver.get_url().await.unwrap_err().stderr(), Some("Unable to get state"));
    }

    #[tokio::test]
    async fn pre_create_check() {
        let mock = Arc::new(
            MockOperations::new()
                .expect("vbm --version", "5.1.2r108956\n", "", None)
                .expect("IsHyperVInstalled", "false", "", None)
                .expect("IsVTXDisabled", "false", "", None)
                .expect("UpdateISOCache /t http://b2d.org", "", "", None)
                .expect("vbm list hostonlyifs", "", "", None),
        );
        let driver = mocked_driver(&mock);

        driver.pre_create_check().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn pre_create_check_refuses_hyperv_and_disabled_vtx() {
        let mock = Arc::new(
            MockOperations::new()
                .expect("vbm --version", "5.1.2r108956", "", None)
                .expect("IsHyperVInstalled", "true", "", None),
        );
        let driver = mocked_driver(&mock);
        assert!(matches!(
            driver.pre_create_check().await.unwrap_err(),
            VBoxError::HyperVConflict
        ));

        let mock = Arc::new(
            MockOperations::new()
                .expect("vbm --version", "5.1.2r108956", "", None)
                .expect("IsHyperVInstalled", "false", "", None)
                .expect("IsVTXDisabled", "true", "", None),
        );
        let driver = mocked_driver(&mock);
        assert!(matches!(
            driver.pre_create_check().await.unwrap_err(),
            VBoxError::VtxDisabled
        ));
    }

    #[tokio::test]
    async fn pre_create_check_skips_virtualization_check() {
        let mock = Arc::new(
            MockOperations::new()
                .expect("vbm --version", "5.1.2r108956", "", None)
                .expect("UpdateISOCache /t http://b2d.org", "", "", None)
                .expect("vbm list hostonlyifs", "", "", None),
        );
        let mut config = VmDescriptor::new("default", "/t");
        config.boot2docker_url = "http://b2d.org".to_string();
        config.no_vtx_check = true;
        let driver = mocked_driver_with(config, &mock);

        driver.pre_create_check().await.unwrap();
        mock.finish();
    }

    fn create_vm_calls(mock: MockOperations, nat_nic_type: &str) -> MockOperations {
        mock.expect("CopyIsoToMachineDir /t default http://b2d.org", "", "", None)
            .expect("Generate /t/machines/default/id_rsa", "", "", None)
            .expect(
                "Create 20000 /t/machines/default/id_rsa.pub /t/machines/default/disk.vmdk",
                "",
                "",
                None,
            )
            .expect("vbm createvm --basefolder /t/machines/default --name default --register", "", "", None)
            .expect(&modify_vm(), "", "", None)
            .expect(
                &format!("vbm modifyvm default --nic1 nat --nictype1 {nat_nic_type} --cableconnected1 on"),
                "",
                "",
                None,
            )
            .expect("vbm storagectl default --name SATA --add sata --hostiocache on", "", "", None)
            .expect("vbm storageattach default --storagectl SATA --port 0 --device 0 --type dvddrive --medium /t/machines/default/boot2docker.iso", "", "", None)
            .expect("vbm storageattach default --storagectl SATA --port 1 --device 0 --type hdd --medium /t/machines/default/disk.vmdk", "", "", None)
            .expect("vbm guestproperty set default /VirtualBox/GuestAdd/SharedFolders/MountPrefix /", "", "", None)
            .expect("vbm guestproperty set default /VirtualBox/GuestAdd/SharedFolders/MountDir /", "", "", None)
    }

    fn config_sharing(dir: &std::path::Path) -> VmDescriptor {
        let mut config = VmDescriptor::new("default", "/t");
        config.boot2docker_url = "http://b2d.org".to_string();
        config.share_folder = Some(format!("{}:share", dir.display()));
        config
    }

    #[tokio::test]
    async fn create_vm() {
        let share = tempfile::tempdir().unwrap();
        let share_dir = share.path().display().to_string();

        let mock = Arc::new(
            create_vm_calls(MockOperations::new(), "82540EM")
                .expect(
                    &format!("vbm sharedfolder add default --name share --hostpath {share_dir} --automount"),
                    "",
                    "",
                    None,
                )
                .expect(
                    "vbm setextradata default VBoxInternal2/SharedFoldersEnableSymlinksCreate/share 1",
                    "",
                    "",
                    None,
                ),
        );
        let mut driver = mocked_driver_with(config_sharing(share.path()), &mock);

        driver.create_vm().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn create_vm_with_specific_nat_nic_type() {
        let share = tempfile::tempdir().unwrap();
        let mut config = config_sharing(share.path());
        config.nat_nic_type = "Am79C973".to_string();
        config.no_share = true;

        let mock = Arc::new(create_vm_calls(MockOperations::new(), "Am79C973"));
        let mut driver = mocked_driver_with(config, &mock);

        driver.create_vm().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn create_vm_skips_missing_share_dir() {
        let share = tempfile::tempdir().unwrap();
        let config = config_sharing(&share.path().join("missing"));

        let mock = Arc::new(create_vm_calls(MockOperations::new(), "82540EM"));
        let mut driver = mocked_driver_with(config, &mock);

        driver.create_vm().await.unwrap();
        mock.finish();
    }

    #[test]
    fn modify_flags_clamp_cpus() {
        let mut config = VmDescriptor::new("default", "/t");
        config.cpu = 64;
        let flags = vm_modify_flags(&config);
        let at = flags.iter().position(|f| f == "--cpus").unwrap();
        assert_eq!(flags[at + 1], "32");

        config.cpu = -1;
        let flags = vm_modify_flags(&config);
        let cpus: i32 = flags[at + 1].parse().unwrap();
        assert!((1..=MAX_CPUS).contains(&cpus));
    }

    #[test]
    fn share_folder_split_on_last_colon() {
        assert_eq!(parse_share_folder("/Users/me/src:src"), ("/Users/me/src", "src"));
        assert_eq!(parse_share_folder(r"C:\Users\me:users"), (r"C:\Users\me", "users"));
        assert_eq!(parse_share_folder("/data:"), ("/data", ""));
        assert_eq!(parse_share_folder("name"), ("", "name"));
    }

    #[tokio::test]
    async fn start() {
        let mock = Arc::new(
            expect_network_setup(
                MockOperations::new().expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None),
            )
            .expect("vbm list hostonlyifs", &adapter_listing("192.168.99.1"), "", None)
            .expect("Interfaces", "", "", None),
        );
        let mut driver = mocked_driver(&mock);

        driver.start().await.unwrap();
        mock.finish();

        assert_eq!(driver.config().ip_address, "192.168.99.100");
        assert_ne!(driver.ssh_port(), 0);
    }

    #[tokio::test]
    async fn start_repairs_corrupted_host_only_adapter() {
        let mock = Arc::new(
            expect_network_setup(
                MockOperations::new().expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None),
            )
            .expect("vbm list hostonlyifs", &adapter_listing("192.168.99.100"), "", None)
            .expect("Interfaces", "", "", None)
            .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
            .expect("vbm controlvm default acpipowerbutton", "", "", None)
            .expect(SHOWVMINFO, r#"VMState="stopped""#, "", None)
            .expect("Sleep 5s", "", "", None)
            .expect(
                &format!("vbm hostonlyif ipconfig {ADAPTER} --ip 192.168.99.1 --netmask 255.255.255.0"),
                "",
                "",
                None,
            )
            .expect("Sleep 5s", "", "", None)
            .expect("vbm startvm default --type headless", "", "", None)
            .expect("WaitIP", "192.168.99.101", "", None),
        );
        let mut driver = mocked_driver(&mock);

        driver.start().await.unwrap();
        mock.finish();

        assert_eq!(driver.config().ip_address, "192.168.99.101");
    }

    #[tokio::test]
    async fn start_refuses_cidr_routed_by_host() {
        let mock = Arc::new(
            MockOperations::new()
                .with_host_interfaces(vec![HostInterface {
                    name: "en0".to_string(),
                    up: true,
                    loopback: false,
                    addrs: vec!["192.168.99.42/24".parse().unwrap()],
                }])
                .expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None)
                .expect("vbm list hostonlyifs", "", "", None)
                .expect("Interfaces", "", "", None),
        );
        let mut driver = mocked_driver(&mock);

        assert!(matches!(
            driver.start().await.unwrap_err(),
            VBoxError::NetworkAddrCollision
        ));
        mock.finish();
    }

    #[tokio::test]
    async fn start_resumes_paused_vm() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="paused""#, "", None)
                .expect("vbm controlvm default resume --type headless", "", "", None)
                .expect("Read /t/machines/default/default/Logs/VBox.log", "", "", None)
                .expect("WaitIP", "192.168.99.100", "", None),
        );
        let mut driver = mocked_driver(&mock);

        driver.start().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn start_detects_vtx_disabled_in_vm_log() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="paused""#, "", None)
                .expect("vbm controlvm default resume --type headless", "", "", None)
                .expect(
                    "Read /t/machines/default/default/Logs/VBox.log",
                    "00:00:00.772 VT-x is disabled in the BIOS (VERR_VMX_MSR_VMX_DISABLED)",
                    "",
                    None,
                ),
        );
        let mut driver = mocked_driver(&mock);

        assert!(matches!(driver.start().await.unwrap_err(), VBoxError::VtxDisabled));
        mock.finish();
    }

    #[tokio::test]
    async fn start_failure_reports_last_log_line() {
        // A saved VM keeps its NIC 2, so only the DHCP server is touched.
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="saved""#, "", None)
                .expect("vbm list hostonlyifs", &adapter_listing("192.168.99.1"), "", None)
                .expect("Interfaces", "", "", None)
                .expect("vbm list dhcpservers", "", "", None)
                .expect("vbm list dhcpservers", "", "", None)
                .expect(IGNORE_CALL, "", "", None)
                .expect("vbm modifyvm default --natpf1 delete ssh", "", "", None)
                .expect("vbm modifyvm default --natpf1 ssh,tcp,127.0.0.1,{any},,22", "", "", None)
                .expect(
                    "vbm startvm default --type headless",
                    "",
                    "",
                    Some(vbm_error("VBoxManage: error: The virtual machine 'default' has terminated unexpectedly")),
                )
                .expect(
                    "Read /t/machines/default/default/Logs/VBox.log",
                    "00:00:00.100 boot\n00:00:01.200 Power up failed (vrc=VERR_SUPDRV_COMPONENT_NOT_FOUND)",
                    "",
                    None,
                ),
        );
        let mut driver = mocked_driver(&mock);

        match driver.start().await.unwrap_err() {
            VBoxError::StartFailed { details, .. } => assert_eq!(
                details.as_deref(),
                Some("00:00:01.200 Power up failed (vrc=VERR_SUPDRV_COMPONENT_NOT_FOUND)")
            ),
            other => panic!("unexpected error {other:?}"),
        }
        mock.finish();
    }

    #[tokio::test]
    async fn stop_waits_for_poweroff() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
                .expect("vbm controlvm default acpipowerbutton", "", "", None)
                .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
                .expect("Sleep 1s", "", "", None)
                .expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None),
        );
        let mut config = VmDescriptor::new("default", "/t");
        config.ip_address = "192.168.99.100".to_string();
        let mut driver = mocked_driver_with(config, &mock);

        driver.stop().await.unwrap();
        mock.finish();
        assert!(driver.config().ip_address.is_empty());
    }

    #[tokio::test]
    async fn stop_resumes_paused_vm_first() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="paused""#, "", None)
                .expect("vbm controlvm default resume", "", "", None)
                .expect("vbm controlvm default acpipowerbutton", "", "", None)
                .expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None),
        );
        let mut driver = mocked_driver(&mock);

        driver.stop().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mock = Arc::new(MockOperations::new().expect(SHOWVMINFO, r#"VMState="poweroff""#, "", None));
        let mut driver = mocked_driver(&mock);

        driver.stop().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn restart_waits_for_a_fresh_ip() {
        let mock = Arc::new(
            MockOperations::new()
                .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
                .expect("vbm controlvm default acpipowerbutton", "", "", None)
                .expect(SHOWVMINFO, r#"VMState="paused""#, "", None)
                .expect(SHOWVMINFO, r#"VMState="paused""#, "", None)
                .expect("vbm controlvm default resume --type headless", "", "", None)
                .expect("Read /t/machines/default/default/Logs/VBox.log", "", "", None)
                .expect("WaitIP", "192.168.99.100", "", None)
                .expect("WaitIP", "192.168.99.101", "", None),
        );
        let mut driver = mocked_driver(&mock);

        driver.restart().await.unwrap();
        mock.finish();
        assert_eq!(driver.config().ip_address, "192.168.99.101");
    }

    #[tokio::test]
    async fn ssh_ip_waiter_gives_up_after_five_polls() {
        let mut mock = MockOperations::new().expect("SSH exit 0", "", "", None);
        for _ in 0..5 {
            mock = mock
                .expect(SHOWVMINFO, "", "", Some(vbm_error("Unable to get state")))
                .expect("Sleep 4s", "", "", None);
        }
        let mock = Arc::new(mock);
        let driver = mocked_driver(&mock);

        assert!(matches!(
            SshIpWaiter.wait(&driver).await.unwrap_err(),
            VBoxError::IpUnavailable
        ));
        mock.finish();
    }

    #[tokio::test]
    async fn ssh_ip_waiter_returns_ip_from_second_poll() {
        let mock = Arc::new(
            MockOperations::new()
                .expect("SSH exit 0", "", "", None)
                .expect(SHOWVMINFO, "", "", Some(vbm_error("Unable to get state")))
                .expect("Sleep 4s", "", "", None)
                .expect(SHOWVMINFO, r#"VMState="running""#, "", None)
                .expect(SHOWVMINFO, "hostonlyadapter2=\"vboxnet0\"\nmacaddress2=\"080027AABBCC\"", "", None)
                .expect(
                    "SSH ip addr show",
                    "2: eth1:\n    link/ether 08:00:27:aa:bb:cc\n    inet 192.168.99.100/24",
                    "",
                    None,
                ),
        );
        let driver = mocked_driver(&mock);

        assert_eq!(SshIpWaiter.wait(&driver).await.unwrap(), "192.168.99.100");
        mock.finish();
    }

    #[tokio::test]
    async fn remove() {
        for (state, kill) in [
            ("poweroff", false),
            ("saved", false),
            ("running", true),
            ("paused", true),
        ] {
            let mut mock = MockOperations::new().expect(
                SHOWVMINFO,
                &format!("VMState=\"{state}\""),
                "",
                None,
            );
            if kill {
                mock = mock.expect("vbm controlvm default poweroff", "", "", None);
            }
            let mock = Arc::new(mock.expect("vbm unregistervm --delete default", "", "", None));
            let driver = mocked_driver(&mock);

            driver.remove().await.unwrap();
            mock.finish();
        }
    }

    #[tokio::test]
    async fn remove_unknown_machine() {
        let mock = Arc::new(MockOperations::new().expect(
            SHOWVMINFO,
            "",
            "",
            Some(vbm_error("VBoxManage: error: Could not find a registered machine named 'default'")),
        ));
        let driver = mocked_driver(&mock);

        driver.remove().await.unwrap();
        mock.finish();
    }

    #[tokio::test]
    async fn kill_powers_off() {
        let mock = Arc::new(MockOperations::new().expect("vbm controlvm default poweroff", "", "", None));
        let driver = mocked_driver(&mock);

        driver.kill().await.unwrap();
        mock.finish();
    }
}
