use super::{ConfigDirective, ModuleCategory, TriState};

const fn builtin(key: &'static str) -> ConfigDirective {
    ConfigDirective {
        key,
        state: TriState::Builtin,
    }
}

const fn module(key: &'static str) -> ConfigDirective {
    ConfigDirective {
        key,
        state: TriState::Module,
    }
}

/// Directives for `name` if it belongs to `category`.
pub fn lookup(category: ModuleCategory, name: &str) -> Option<&'static [ConfigDirective]> {
    match category {
        ModuleCategory::CryptoHotPath => crypto(name),
        ModuleCategory::StorageHotPath => storage(name),
        ModuleCategory::CompressionMedium => compression(name),
        ModuleCategory::CoreBlockDevice => core_block(name),
        ModuleCategory::VirtualizationConditional => virtualization(name),
        ModuleCategory::Uncategorized => None,
    }
}

fn crypto(name: &str) -> Option<&'static [ConfigDirective]> {
    let directives: &'static [ConfigDirective] = match name {
        "aesni_intel" => const { &[builtin("CONFIG_CRYPTO_AES_NI_INTEL")] },
        "aes_x86_64" | "aes_generic" => const { &[builtin("CONFIG_CRYPTO_AES")] },
        "crc32c_intel" => const { &[builtin("CONFIG_CRYPTO_CRC32C_INTEL")] },
        "crc32_pclmul" => const { &[builtin("CONFIG_CRYPTO_CRC32_PCLMUL")] },
        "crct10dif_pclmul" => const { &[builtin("CONFIG_CRYPTO_CRCT10DIF_PCLMUL")] },
        "ghash_clmulni_intel" => const { &[builtin("CONFIG_CRYPTO_GHASH_CLMUL_NI_INTEL")] },
        "sha1_ssse3" => const { &[builtin("CONFIG_CRYPTO_SHA1_SSSE3")] },
        "sha256_ssse3" => const { &[builtin("CONFIG_CRYPTO_SHA256_SSSE3")] },
        "sha512_ssse3" => const { &[builtin("CONFIG_CRYPTO_SHA512_SSSE3")] },
        "polyval_clmulni" => const { &[builtin("CONFIG_CRYPTO_POLYVAL_CLMUL_NI")] },
        "chacha_x86_64" => const { &[builtin("CONFIG_CRYPTO_CHACHA20_X86_64")] },
        "poly1305_x86_64" => const { &[builtin("CONFIG_CRYPTO_POLY1305_X86_64")] },
        "dm_crypt" => const { &[builtin("CONFIG_DM_CRYPT")] },
        _ => return None,
    };
    Some(directives)
}

fn storage(name: &str) -> Option<&'static [ConfigDirective]> {
    let directives: &'static [ConfigDirective] = match name {
        "nvme" => const { &[builtin("CONFIG_BLK_DEV_NVME")] },
        "nvme_core" => const { &[builtin("CONFIG_NVME_CORE")] },
        "ahci" => const { &[builtin("CONFIG_SATA_AHCI")] },
        "libahci" => const { &[builtin("CONFIG_SATA_AHCI"), builtin("CONFIG_ATA")] },
        "ext4" => const { &[builtin("CONFIG_EXT4_FS")] },
        "btrfs" => const { &[builtin("CONFIG_BTRFS_FS")] },
        "xfs" => const { &[builtin("CONFIG_XFS_FS")] },
        "f2fs" => const { &[builtin("CONFIG_F2FS_FS")] },
        "jbd2" => const { &[builtin("CONFIG_JBD2")] },
        "mbcache" => const { &[builtin("CONFIG_FS_MBCACHE")] },
        "dm_mod" => const { &[builtin("CONFIG_BLK_DEV_DM")] },
        "md_mod" => const { &[builtin("CONFIG_BLK_DEV_MD")] },
        "raid1" => const { &[builtin("CONFIG_MD_RAID1")] },
        "raid456" => const { &[builtin("CONFIG_MD_RAID456")] },
        _ => return None,
    };
    Some(directives)
}

fn compression(name: &str) -> Option<&'static [ConfigDirective]> {
    let directives: &'static [ConfigDirective] = match name {
        "zstd" | "zstd_compress" => const { &[module("CONFIG_CRYPTO_ZSTD")] },
        "lz4" | "lz4_compress" => const { &[module("CONFIG_CRYPTO_LZ4")] },
        "lz4hc" | "lz4hc_compress" => const { &[module("CONFIG_CRYPTO_LZ4HC")] },
        "lzo" | "lzo_rle" => const { &[module("CONFIG_CRYPTO_LZO")] },
        "842" => const { &[module("CONFIG_CRYPTO_842")] },
        "zram" => const { &[module("CONFIG_ZRAM")] },
        "zsmalloc" => const { &[module("CONFIG_ZSMALLOC")] },
        _ => return None,
    };
    Some(directives)
}

fn core_block(name: &str) -> Option<&'static [ConfigDirective]> {
    let directives: &'static [ConfigDirective] = match name {
        "loop" => const { &[builtin("CONFIG_BLK_DEV_LOOP")] },
        "sd_mod" => const { &[builtin("CONFIG_BLK_DEV_SD")] },
        "scsi_mod" => const { &[builtin("CONFIG_SCSI")] },
        "sr_mod" => const { &[builtin("CONFIG_BLK_DEV_SR")] },
        "nbd" => const { &[builtin("CONFIG_BLK_DEV_NBD")] },
        _ => return None,
    };
    Some(directives)
}

fn virtualization(name: &str) -> Option<&'static [ConfigDirective]> {
    let directives: &'static [ConfigDirective] = match name {
        "kvm" => const { &[builtin("CONFIG_KVM")] },
        "kvm_intel" => const { &[builtin("CONFIG_KVM_INTEL")] },
        "kvm_amd" => const { &[builtin("CONFIG_KVM_AMD")] },
        "vhost" => const { &[builtin("CONFIG_VHOST")] },
        "vhost_net" => const { &[builtin("CONFIG_VHOST_NET")] },
        "virtio" => const { &[builtin("CONFIG_VIRTIO")] },
        "virtio_pci" => const { &[builtin("CONFIG_VIRTIO_PCI")] },
        "virtio_blk" => const { &[builtin("CONFIG_VIRTIO_BLK")] },
        "virtio_net" => const { &[builtin("CONFIG_VIRTIO_NET")] },
        "virtio_scsi" => const { &[builtin("CONFIG_SCSI_VIRTIO")] },
        "virtio_balloon" => const { &[builtin("CONFIG_VIRTIO_BALLOON")] },
        "virtio_console" => const { &[builtin("CONFIG_VIRTIO_CONSOLE")] },
        _ => return None,
    };
    Some(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_hand_out_static_slices() {
        let ahci: &'static [ConfigDirective] =
            lookup(ModuleCategory::StorageHotPath, "libahci").expect("libahci");
        assert_eq!(
            ahci.iter().map(|d| d.key).collect::<Vec<_>>(),
            ["CONFIG_SATA_AHCI", "CONFIG_ATA"]
        );
        assert_eq!(
            lookup(ModuleCategory::CompressionMedium, "zram").map(|d| d[0].state),
            Some(TriState::Module)
        );
        assert!(lookup(ModuleCategory::CryptoHotPath, "nvme").is_none());
        assert!(lookup(ModuleCategory::Uncategorized, "nvme").is_none());
    }
}
