//! Kernel struct offset discovery. The collector programs read per-task
//! I/O accounting and per-socket TCP counters through raw offsets; those
//! offsets vary by kernel, so they are discovered from the kernel's BTF
//! at startup and written into the collector's global data before attach.
//! Anything that cannot be discovered stays zero and the corresponding
//! reading degrades to zero bytes.

use anyhow::{anyhow, Context, Result};
use btf::btf::{Btf, Struct, Type};
use planscout_common::TaskOffsets;

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const ENV_KERNEL_BTF_PATH: &str = "PLANSCOUT_KERNEL_BTF";

pub fn derive_task_offsets() -> Result<TaskOffsets> {
    let btf_path =
        std::env::var(ENV_KERNEL_BTF_PATH).unwrap_or_else(|_| KERNEL_BTF_PATH.to_string());
    let btf = Btf::from_file(btf_path).context("failed to load kernel BTF metadata")?;

    let task_struct = expect_named_struct(&btf, "task_struct")?;
    let mut offsets = TaskOffsets::zeroed();

    match io_accounting_offsets(&btf, task_struct) {
        Ok((ioac, read_bytes, write_bytes)) => {
            offsets.task_ioac_offset = ioac;
            offsets.ioac_read_bytes_offset = read_bytes;
            offsets.ioac_write_bytes_offset = write_bytes;
        }
        Err(err) => {
            log::warn!("[scoutd] task I/O accounting unavailable: {err:#}");
        }
    }

    match socket_chain_offsets(&btf, task_struct) {
        Ok(chain) => {
            offsets.task_files_offset = chain.task_files;
            offsets.files_fdt_offset = chain.files_fdt;
            offsets.fdt_fd_offset = chain.fdt_fd;
            offsets.file_private_data_offset = chain.file_private_data;
            offsets.socket_sk_offset = chain.socket_sk;
            offsets.tcp_bytes_received_offset = chain.tcp_bytes_received;
            offsets.tcp_bytes_sent_offset = chain.tcp_bytes_sent;
        }
        Err(err) => {
            log::warn!("[scoutd] socket counter chain unavailable: {err:#}");
        }
    }

    Ok(offsets)
}

fn io_accounting_offsets(btf: &Btf, task_struct: &Struct) -> Result<(u32, u32, u32)> {
    let (ioac_bits, ioac_type) = member_offset(task_struct, "ioac")?;
    let ioac = resolve_struct_deep(btf, ioac_type)?;
    let (read_bits, _) = member_offset(ioac, "read_bytes")?;
    let (write_bits, _) = member_offset(ioac, "write_bytes")?;
    Ok((
        to_bytes(ioac_bits)?,
        to_bytes(read_bits)?,
        to_bytes(write_bits)?,
    ))
}

struct SocketChain {
    task_files: u32,
    files_fdt: u32,
    fdt_fd: u32,
    file_private_data: u32,
    socket_sk: u32,
    tcp_bytes_received: u32,
    tcp_bytes_sent: u32,
}

fn socket_chain_offsets(btf: &Btf, task_struct: &Struct) -> Result<SocketChain> {
    let (files_bits, _) = member_offset(task_struct, "files")?;
    let files_struct = expect_named_struct(btf, "files_struct")?;
    let (fdt_bits, _) = member_offset(files_struct, "fdt")?;
    let fdtable = expect_named_struct(btf, "fdtable")?;
    let (fd_bits, _) = member_offset(fdtable, "fd")?;
    let file_struct = expect_named_struct(btf, "file")?;
    let (private_bits, _) = member_offset(file_struct, "private_data")?;
    let socket_struct = expect_named_struct(btf, "socket")?;
    let (sk_bits, _) = member_offset(socket_struct, "sk")?;
    let tcp_sock = expect_named_struct(btf, "tcp_sock")?;
    let (received_bits, _) = member_offset(tcp_sock, "bytes_received")?;
    let (sent_bits, _) = member_offset(tcp_sock, "bytes_sent")?;
    Ok(SocketChain {
        task_files: to_bytes(files_bits)?,
        files_fdt: to_bytes(fdt_bits)?,
        fdt_fd: to_bytes(fd_bits)?,
        file_private_data: to_bytes(private_bits)?,
        socket_sk: to_bytes(sk_bits)?,
        tcp_bytes_received: to_bytes(received_bits)?,
        tcp_bytes_sent: to_bytes(sent_bits)?,
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

fn resolve_struct_deep(btf: &Btf, mut type_id: u32) -> Result<&Struct> {
    for _ in 0..32 {
        let ty = btf
            .get_type_by_id(type_id)
            .with_context(|| format!("failed to resolve type id {type_id}"))?;
        match &ty.base_type {
            Type::Struct(st) => return Ok(st),
            Type::Const(map)
            | Type::Volatile(map)
            | Type::Restrict(map)
            | Type::Typedef(map)
            | Type::TypeTag(map)
            | Type::Pointer(map) => {
                type_id = map.type_id;
            }
            other => {
                return Err(anyhow!(
                    "type id {type_id} does not resolve to a struct ({other:?})"
                ));
            }
        }
    }

    Err(anyhow!(
        "type resolution exceeded while resolving struct for type id {type_id}"
    ))
}

fn member_offset(st: &Struct, name: &str) -> Result<(u32, u32)> {
    st.members
        .iter()
        .find(|member| member.name.as_deref() == Some(name))
        .map(|member| (member.offset, member.type_id))
        .ok_or_else(|| anyhow!("member {name} not found"))
}

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
    fn to_bytes_rejects_bitfields() {
        assert_eq!(to_bytes(0).unwrap(), 0);
        assert_eq!(to_bytes(64).unwrap(), 8);
        assert!(to_bytes(3).is_err());
    }
}
