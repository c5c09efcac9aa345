use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};

use vbox_machine::virtualbox::models::{
    UiType, VmDescriptor, DEFAULT_HOST_ONLY_CIDR, DEFAULT_HOST_ONLY_PROMISC_MODE, DEFAULT_NIC_TYPE,
};
use vbox_machine::virtualbox::store;
use vbox_machine::virtualbox::util::home_dir;
use vbox_machine::virtualbox::VirtualBoxDriver;

#[derive(Parser, Debug)]
#[command(version, about = "Provision and drive a boot2docker VM through VBoxManage", long_about = None)]
struct Args {
    /// Directory holding machines and the ISO cache
    #[arg(short, long, env = "MACHINE_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Machine name
    #[arg(short, long, default_value = "default")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the VM and start it
    Create(CreateArgs),
    Start,
    Stop,
    Restart,
    /// Power the VM off without a clean shutdown
    Kill,
    /// Delete the VM and everything stored for it
    Rm,
    Status,
    Ip,
    Url,
    SshPort,
}

#[derive(ClapArgs, Debug)]
struct CreateArgs {
    /// Size of memory for host in MB
    #[arg(long = "virtualbox-memory", env = "VIRTUALBOX_MEMORY_SIZE", default_value_t = 1024)]
    memory: u32,

    /// Number of CPUs for the machine (-1 to use the number of CPUs available)
    #[arg(
        long = "virtualbox-cpu-count",
        env = "VIRTUALBOX_CPU_COUNT",
        default_value_t = 1,
        allow_negative_numbers = true
    )]
    cpu_count: i32,

    /// Size of disk for host in MB
    #[arg(long = "virtualbox-disk-size", env = "VIRTUALBOX_DISK_SIZE", default_value_t = 20000)]
    disk_size: u64,

    /// The URL of the boot2docker image. Defaults to the latest available version
    #[arg(long = "virtualbox-boot2docker-url", env = "VIRTUALBOX_BOOT2DOCKER_URL", default_value = "")]
    boot2docker_url: String,

    /// The name of a Boot2Docker VM to import
    #[arg(long = "virtualbox-import-boot2docker-vm", env = "VIRTUALBOX_IMPORT_BOOT2DOCKER_VM")]
    import_boot2docker_vm: Option<String>,

    /// Use the host DNS resolver
    #[arg(long = "virtualbox-host-dns-resolver", env = "VIRTUALBOX_HOST_DNS_RESOLVER")]
    host_dns_resolver: bool,

    /// Specify the Network Adapter Type
    #[arg(long = "virtualbox-nat-nictype", env = "VIRTUALBOX_NAT_NICTYPE", default_value = DEFAULT_NIC_TYPE)]
    nat_nic_type: String,

    /// Specify the Host Only CIDR
    #[arg(long = "virtualbox-hostonly-cidr", env = "VIRTUALBOX_HOSTONLY_CIDR", default_value = DEFAULT_HOST_ONLY_CIDR)]
    host_only_cidr: String,

    /// Specify the Host Only Network Adapter Type
    #[arg(long = "virtualbox-hostonly-nictype", env = "VIRTUALBOX_HOSTONLY_NIC_TYPE", default_value = DEFAULT_NIC_TYPE)]
    host_only_nic_type: String,

    /// Specify the Host Only Network Adapter Promiscuous Mode
    #[arg(
        long = "virtualbox-hostonly-nicpromisc",
        env = "VIRTUALBOX_HOSTONLY_NIC_PROMISC",
        default_value = DEFAULT_HOST_ONLY_PROMISC_MODE
    )]
    host_only_promisc_mode: String,

    /// Specify the UI Type: (gui|sdl|headless|separate)
    #[arg(long = "virtualbox-ui-type", env = "VIRTUALBOX_UI_TYPE", default_value = "headless")]
    ui_type: UiType,

    /// Disable the Host Only DHCP Server
    #[arg(long = "virtualbox-hostonly-no-dhcp", env = "VIRTUALBOX_HOSTONLY_NO_DHCP")]
    host_only_no_dhcp: bool,

    /// Disable the mount of your home directory
    #[arg(long = "virtualbox-no-share", env = "VIRTUALBOX_NO_SHARE")]
    no_share: bool,

    /// Disable proxying all DNS requests to the host
    #[arg(long = "virtualbox-no-dns-proxy", env = "VIRTUALBOX_NO_DNS_PROXY")]
    no_dns_proxy: bool,

    /// Disable checking for the availability of hardware virtualization before the vm is started
    #[arg(long = "virtualbox-no-vtx-check", env = "VIRTUALBOX_NO_VTX_CHECK")]
    no_vtx_check: bool,

    /// Mount the specified directory instead of the default home location. Format: dir:name
    #[arg(long = "virtualbox-share-folder", env = "VIRTUALBOX_SHARE_FOLDER")]
    share_folder: Option<String>,
}

impl CreateArgs {
    fn descriptor(self, name: &str, store_path: &Path) -> VmDescriptor {
        let mut config = VmDescriptor::new(name, store_path);
        config.cpu = self.cpu_count;
        config.memory = self.memory;
        config.disk_size = self.disk_size;
        config.boot2docker_url = self.boot2docker_url;
        config.boot2docker_import_vm = self.import_boot2docker_vm;
        config.host_dns_resolver = self.host_dns_resolver;
        config.nat_nic_type = self.nat_nic_type;
        config.host_only_cidr = self.host_only_cidr;
        config.host_only_nic_type = self.host_only_nic_type;
        config.host_only_promisc_mode = self.host_only_promisc_mode;
        config.ui_type = self.ui_type;
        config.host_only_no_dhcp = self.host_only_no_dhcp;
        config.no_share = self.no_share;
        config.dns_proxy = !self.no_dns_proxy;
        config.no_vtx_check = self.no_vtx_check;
        config.share_folder = self.share_folder;
        config
    }
}

fn load_driver(store_path: &Path, name: &str) -> anyhow::Result<VirtualBoxDriver> {
    let config = store::load(store_path, name)
        .with_context(|| format!("Failed to load machine {name:?} from {}", store_path.display()))?;
    Ok(VirtualBoxDriver::new(config)?)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store_path = args
        .storage_path
        .unwrap_or_else(|| home_dir().join(".vbox-machine"));
    let name = args.name;

    match args.command {
        Command::Create(create) => {
            if store::exists(&store_path, &name) {
                bail!("Machine {name:?} already exists");
            }

            let mut driver = VirtualBoxDriver::new(create.descriptor(&name, &store_path))?;
            driver
                .pre_create_check()
                .await
                .context("Error with pre-create check")?;

            info!("Creating machine {}...", name);
            let created = driver.create().await;
            // Keep the record even on failure so `rm` can clean up.
            store::save(driver.config())?;
            created.context("Error creating machine")?;

            info!("Machine {} is running at {}", name, driver.config().ip_address);
        }
        Command::Start => {
            let mut driver = load_driver(&store_path, &name)?;
            driver.start().await.context("Error starting machine")?;
            store::save(driver.config())?;
        }
        Command::Stop => {
            let mut driver = load_driver(&store_path, &name)?;
            driver.stop().await.context("Error stopping machine")?;
            store::save(driver.config())?;
        }
        Command::Restart => {
            let mut driver = load_driver(&store_path, &name)?;
            driver.restart().await.context("Error restarting machine")?;
            store::save(driver.config())?;
        }
        Command::Kill => {
            let driver = load_driver(&store_path, &name)?;
            driver.kill().await.context("Error killing machine")?;
        }
        Command::Rm => {
            let driver = load_driver(&store_path, &name)?;
            driver.remove().await.context("Error removing machine")?;
            store::remove(driver.config())?;
            info!("Successfully removed {}", name);
        }
        Command::Status => {
            let driver = load_driver(&store_path, &name)?;
            println!("{}", driver.get_state().await?);
        }
        Command::Ip => {
            let driver = load_driver(&store_path, &name)?;
            println!("{}", driver.get_ip().await?);
        }
        Command::Url => {
            let driver = load_driver(&store_path, &name)?;
            println!("{}", driver.get_url().await?);
        }
        Command::SshPort => {
            let driver = load_driver(&store_path, &name)?;
            println!("{}", driver.ssh_port());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
