//! Objects that must always exist, served from a read-only layer

use crate::backing::{BackingStore, MemoryBacking};
use crate::error::Result;
use provision_models::{BootEnv, Model, Stage, TemplateInfo};

const LOCAL_PXELINUX: &str = "DEFAULT local
PROMPT 0
TIMEOUT 10
LABEL local
localboot 0
";

/// Bootenv for known machines that should boot from local disk
pub fn local_boot_env() -> BootEnv {
    let mut env = BootEnv::new("local");
    env.description =
        "The boot environment you should use to have known machines boot off their local hard drive"
            .to_string();
    env.templates = vec![
        TemplateInfo::new("pxelinux", "pxelinux.cfg/{{ machine.hex_address }}", LOCAL_PXELINUX),
        TemplateInfo::new("elilo", "{{ machine.hex_address }}.conf", "exit"),
        TemplateInfo::new("ipxe", "{{ machine.address }}.ipxe", "#!ipxe\nexit\n"),
    ];
    env
}

/// Bootenv for unknown machines that should boot from local disk
pub fn ignore_boot_env() -> BootEnv {
    let mut env = BootEnv::new("ignore");
    env.description =
        "The boot environment you should use to have unknown machines boot off their local hard drive"
            .to_string();
    env.only_unknown = true;
    env.templates = vec![
        TemplateInfo::new("pxelinux", "pxelinux.cfg/default", LOCAL_PXELINUX),
        TemplateInfo::new("elilo", "elilo.conf", "exit"),
        TemplateInfo::new(
            "ipxe",
            "default.ipxe",
            "#!ipxe\nchain tftp://{{ provisioner_address }}/${netX/ip}.ipxe || exit\n",
        ),
    ];
    env
}

pub fn none_stage() -> Stage {
    Stage::new("none")
}

fn seed<T: Model>(layer: &MemoryBacking, obj: &T) -> Result<()> {
    layer.seed(T::PREFIX, &obj.key(), serde_json::to_vec(obj)?);
    Ok(())
}

/// The read-only bottom layer holding the default objects
pub fn default_layer() -> Result<MemoryBacking> {
    let layer = MemoryBacking::new();
    seed(&layer, &local_boot_env())?;
    seed(&layer, &ignore_boot_env())?;
    seed(&layer, &none_stage())?;
    let layer = layer.into_read_only();
    debug_assert!(layer.read_only());
    Ok(layer)
}
