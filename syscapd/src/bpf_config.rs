//! Derives the `task_struct -> nsproxy -> mnt_ns -> ns_common.inum` field
//! offsets the kernel program needs to read a task's mount namespace id,
//! by walking the running kernel's BTF type info. This is the CO-RE offset
//! table handed to the kernel program as the `TELEMETRY_CONFIG` global
//! (§6 kernel-side ABI).

use anyhow::{Context, Result, anyhow};
use btf::btf::{Btf, Struct, Type};
use recorder_ebpf_common::TelemetryConfig;

pub fn derive_telemetry_config(btf_path: &str) -> Result<TelemetryConfig> {
    let btf = Btf::from_file(btf_path).context("failed to load kernel BTF metadata")?;

    let task_struct = expect_named_struct(&btf, "task_struct")?;
    let (tgid_bits, _) = member_offset(task_struct, "tgid")?;
    let (comm_bits, _) = member_offset(task_struct, "comm")?;
    let (nsproxy_bits, nsproxy_type) = member_offset(task_struct, "nsproxy")?;

    let nsproxy_struct = resolve_pointee_struct(&btf, nsproxy_type)?;
    let (mnt_ns_bits, mnt_ns_type) = member_offset(nsproxy_struct, "mnt_ns")?;

    let mnt_namespace_struct = resolve_pointee_struct(&btf, mnt_ns_type)?;
    let (ns_common_bits, ns_common_type) = member_offset(mnt_namespace_struct, "ns")?;

    let ns_common_struct = resolve_struct(&btf, ns_common_type)?;
    let (inum_bits, _) = member_offset(ns_common_struct, "inum")?;

    Ok(TelemetryConfig {
        task_tgid_offset: to_bytes(tgid_bits)?,
        task_comm_offset: to_bytes(comm_bits)?,
        task_nsproxy_offset: to_bytes(nsproxy_bits)?,
        nsproxy_mnt_ns_offset: to_bytes(mnt_ns_bits)?,
        mnt_ns_ns_common_offset: to_bytes(ns_common_bits)?,
        ns_common_inum_offset: to_bytes(inum_bits)?,
        _pad: 0,
    })
}

fn expect_named_struct<'a>(btf: &'a Btf, name: &str) -> Result<&'a Struct> {
    let ty = btf
        .get_type_by_name(name)
        .with_context(|| format!("type {name} not found in BTF"))?;
    match &ty.base_type {
        Type::Struct(st) => Ok(st),
        other => Err(anyhow!("type {name} is not a struct (found {:?})", other)),
    }
}

fn resolve_struct(btf: &Btf, type_id: u32) -> Result<&Struct> {
    let ty = btf
        .get_type_by_id(type_id)
        .with_context(|| format!("failed to resolve type id {type_id}"))?;
    match &ty.base_type {
        Type::Struct(st) => Ok(st),
        other => Err(anyhow!(
            "expected struct for type id {type_id}, found {:?}",
            other
        )),
    }
}

/// Strips `const`/`volatile`/`typedef`/pointer wrappers to reach the
/// pointed-to struct, the way every field in this chain is expressed
/// (`struct nsproxy *nsproxy`, `struct mnt_namespace *mnt_ns`).
fn resolve_pointee_struct(btf: &Btf, mut type_id: u32) -> Result<&Struct> {
    for _ in 0..16 {
        let ty = btf
            .get_type_by_id(type_id)
            .with_context(|| format!("failed to resolve type id {type_id}"))?;
        match &ty.base_type {
            Type::Pointer(map) => type_id = map.type_id,
            Type::Const(map) | Type::Volatile(map) | Type::Restrict(map) | Type::Typedef(map) => {
                type_id = map.type_id
            }
            Type::Struct(st) => return Ok(st),
            other => return Err(anyhow!("expected pointer-to-struct, found {:?}", other)),
        }
    }
    Err(anyhow!(
        "type resolution exceeded while resolving pointee of type id {type_id}"
    ))
}

fn member_offset(st: &Struct, name: &str) -> Result<(u32, u32)> {
    st.members
        .iter()
        .find(|member| member.name.as_deref() == Some(name))
        .map(|member| (member.offset, member.type_id))
        .ok_or_else(|| anyhow!("member {name} not found"))
}

#[allow(clippy::manual_is_multiple_of)]
fn to_bytes(bits: u32) -> Result<u32> {
    if bits % 8 == 0 {
        Ok(bits / 8)
    } else {
        Err(anyhow!("member offset {bits} is not byte aligned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_roundtrip() {
        assert_eq!(to_bytes(0).unwrap(), 0);
        assert_eq!(to_bytes(8).unwrap(), 1);
        assert!(to_bytes(3).is_err());
    }
}
