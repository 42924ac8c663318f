//! Builder that materialises the argv for the hypervisor process. See spec
//! §4.5. Pure in the sense that it only produces a `Command`; spawning is the
//! caller's concern (so tests can inspect the argv without starting QEMU).

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::core::config::Arch;
use crate::error::Result;

/// Per-architecture QEMU machine defaults, from the upstream `QEMU_ARCH`
/// table this executor was derived from.
struct ArchDefaults {
    machine: &'static str,
    cpu_model: Option<&'static str>,
    bios: Option<&'static str>,
}

fn arch_defaults(arch: Arch) -> ArchDefaults {
    match arch {
        Arch::X86_64 => ArchDefaults {
            machine: "pc,accel=kvm",
            cpu_model: None,
            bios: None,
        },
        Arch::Aarch64 => ArchDefaults {
            machine: "virt,gic_version=3,accel=kvm",
            cpu_model: Some("host"),
            bios: Some("/usr/share/qemu-efi-aarch64/QEMU_EFI.fd"),
        },
    }
}

/// Accumulates decoupled configuration slots and builds the final argv.
#[derive(Debug, Clone)]
pub struct HypervisorInvocation {
    binary: String,
    cpu_cores: u32,
    memory: u32,
    drive: String,
    machine: String,
    cpu_model: Option<String>,
    bios: Option<PathBuf>,
    pub qmp_sockets: Vec<PathBuf>,
    pub net_user: Vec<String>,
    pub smbios_11: Vec<String>,
}

impl HypervisorInvocation {
    pub fn for_arch(arch: Arch, drive: impl Into<String>) -> Self {
        let defaults = arch_defaults(arch);
        HypervisorInvocation {
            binary: arch.qemu_binary().to_string(),
            cpu_cores: 1,
            memory: 512,
            drive: drive.into(),
            machine: defaults.machine.to_string(),
            cpu_model: defaults.cpu_model.map(str::to_string),
            bios: defaults.bios.map(PathBuf::from),
            qmp_sockets: Vec::new(),
            net_user: Vec::new(),
            smbios_11: Vec::new(),
        }
    }

    pub fn cpu_cores(mut self, cpu_cores: u32) -> Self {
        self.cpu_cores = cpu_cores;
        self
    }

    pub fn memory_mib(mut self, memory: u32) -> Self {
        self.memory = memory;
        self
    }

    /// Builds the full argument vector, in the fixed order spec §4.5 pins:
    /// `-display none`, the drive, the nic, the net_user group, machine and
    /// memory/smp switches, then the variable qmp/smbios slots.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-machine".to_string(),
            self.machine.clone(),
            "-m".to_string(),
            self.memory.to_string(),
            "-smp".to_string(),
            self.cpu_cores.to_string(),
            "-display".to_string(),
            "none".to_string(),
            "-drive".to_string(),
            self.drive.clone(),
            "-net".to_string(),
            "nic,model=virtio".to_string(),
            "-net".to_string(),
            format!(
                "user{}",
                self.net_user
                    .iter()
                    .map(|param| format!(",{param}"))
                    .collect::<String>()
            ),
        ];

        if let Some(cpu_model) = &self.cpu_model {
            args.push("-cpu".to_string());
            args.push(cpu_model.clone());
        }

        if let Some(bios) = &self.bios {
            args.push("-bios".to_string());
            args.push(bios.display().to_string());
        }

        for socket in &self.qmp_sockets {
            args.push("-qmp".to_string());
            args.push(format!("unix:{},server,nowait", socket.display()));
        }

        for value in &self.smbios_11 {
            args.push("-smbios".to_string());
            args.push(format!("type=11,{value}"));
        }

        args
    }

    /// Spawns the hypervisor. The child's process group is set to itself so
    /// it does not receive foreground signals meant for the supervisor.
    pub fn spawn(&self) -> Result<Child> {
        let mut command = Command::new(&self.binary);
        command.args(self.build_args());
        command.stdin(Stdio::inherit());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = command.spawn()?;
        Ok(child)
    }
}

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Builds the `-drive` value for a qcow2 overlay rooted at `path`.
pub fn drive_arg(path: &Path) -> String {
    format!("file={},media=disk,if=virtio", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qmp_sockets_appear_once_each_in_order() {
        let mut invocation = HypervisorInvocation::for_arch(Arch::X86_64, "file=/tmp/root.qcow2");
        invocation.qmp_sockets.push(PathBuf::from("/tmp/a.sock"));
        invocation.qmp_sockets.push(PathBuf::from("/tmp/b.sock"));

        let args = invocation.build_args();
        let qmp_positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-qmp")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(qmp_positions.len(), 2);
        assert_eq!(args[qmp_positions[0] + 1], "unix:/tmp/a.sock,server,nowait");
        assert_eq!(args[qmp_positions[1] + 1], "unix:/tmp/b.sock,server,nowait");
    }

    #[test]
    fn smbios_entries_preserve_insertion_order() {
        let mut invocation = HypervisorInvocation::for_arch(Arch::X86_64, "file=/tmp/root.qcow2");
        invocation.smbios_11.push("value=first".to_string());
        invocation.smbios_11.push("value=second".to_string());

        let args = invocation.build_args();
        let positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-smbios")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(args[positions[0] + 1], "type=11,value=first");
        assert_eq!(args[positions[1] + 1], "type=11,value=second");
    }

    #[test]
    fn aarch64_gets_bios_and_cpu_model() {
        let invocation = HypervisorInvocation::for_arch(Arch::Aarch64, "file=/tmp/root.qcow2");
        let args = invocation.build_args();
        assert!(args.iter().any(|a| a == "-bios"));
        assert!(args.windows(2).any(|w| w[0] == "-cpu" && w[1] == "host"));
    }

    #[test]
    fn x86_64_has_no_bios_override() {
        let invocation = HypervisorInvocation::for_arch(Arch::X86_64, "file=/tmp/root.qcow2");
        let args = invocation.build_args();
        assert!(!args.iter().any(|a| a == "-bios"));
    }

    #[test]
    fn net_user_params_are_comma_joined() {
        let mut invocation = HypervisorInvocation::for_arch(Arch::X86_64, "file=/tmp/root.qcow2");
        invocation.net_user.push("hostfwd=tcp:127.0.0.1:2222-:22".to_string());
        let args = invocation.build_args();
        let idx = args.iter().position(|a| a == "user,hostfwd=tcp:127.0.0.1:2222-:22");
        assert!(idx.is_some());
    }

    #[test]
    fn fixed_flags_are_always_present() {
        let invocation = HypervisorInvocation::for_arch(Arch::X86_64, "file=/tmp/root.qcow2");
        let args = invocation.build_args();
        assert!(args.windows(2).any(|w| w[0] == "-display" && w[1] == "none"));
        assert!(args.iter().any(|a| a == "-drive"));
    }
}
