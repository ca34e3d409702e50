//! Architecture name mapping between native arch strings and OCI platform
//! values. The table is fixed; unknown names map through unchanged.

pub fn arch_to_oci(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "i386" => "386",
        other => other,
    }
}

pub fn oci_to_arch(oci: &str) -> &str {
    match oci {
        "amd64" => "x86_64",
        "arm64" => "aarch64",
        "386" => "i386",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_mappings() {
        assert_eq!(arch_to_oci("x86_64"), "amd64");
        assert_eq!(arch_to_oci("aarch64"), "arm64");
        assert_eq!(arch_to_oci("i386"), "386");
        assert_eq!(oci_to_arch("amd64"), "x86_64");
        assert_eq!(oci_to_arch("arm64"), "aarch64");
        assert_eq!(oci_to_arch("386"), "i386");
    }

    #[test]
    fn unknown_is_identity() {
        assert_eq!(arch_to_oci("riscv64"), "riscv64");
        assert_eq!(oci_to_arch("riscv64"), "riscv64");
    }

    #[test]
    fn roundtrip_known() {
        for arch in ["x86_64", "aarch64", "i386"] {
            assert_eq!(oci_to_arch(arch_to_oci(arch)), arch);
        }
    }
}
