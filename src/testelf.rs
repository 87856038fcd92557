//! Hand-assembled minimal ELF64 images for tests.
//!
//! Builds a valid little-endian x86-64 executable with a single PT_LOAD
//! segment and a `.text` section holding the given bytes, small enough to
//! assert exact offsets and addresses against.

/// File offset of the `.text` payload inside [`tiny_elf`] images.
pub const TEXT_OFFSET: u64 = 0x80;

/// Load address of the image.
pub const LOAD_VADDR: u64 = 0x400000;

/// Virtual address of the `.text` payload.
pub const TEXT_VADDR: u64 = LOAD_VADDR + TEXT_OFFSET;

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Build a minimal x86-64 ET_EXEC image whose `.text` section contains
/// `text` at file offset [`TEXT_OFFSET`] / address [`TEXT_VADDR`].
pub fn tiny_elf(text: &[u8]) -> Vec<u8> {
    let shstrtab: &[u8] = b"\0.text\0.shstrtab\0";
    let str_off = TEXT_OFFSET as usize + text.len();
    let mut sh_off = str_off + shstrtab.len();
    sh_off = (sh_off + 7) & !7;

    let mut buf = Vec::new();

    // ELF header.
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    buf.extend_from_slice(&[0u8; 8]);
    push_u16(&mut buf, 2); // ET_EXEC
    push_u16(&mut buf, 62); // EM_X86_64
    push_u32(&mut buf, 1);
    push_u64(&mut buf, TEXT_VADDR); // e_entry
    push_u64(&mut buf, 64); // e_phoff
    push_u64(&mut buf, sh_off as u64); // e_shoff
    push_u32(&mut buf, 0);
    push_u16(&mut buf, 64); // e_ehsize
    push_u16(&mut buf, 56); // e_phentsize
    push_u16(&mut buf, 1); // e_phnum
    push_u16(&mut buf, 64); // e_shentsize
    push_u16(&mut buf, 3); // e_shnum
    push_u16(&mut buf, 2); // e_shstrndx

    // One PT_LOAD covering the whole file.
    let file_size = (sh_off + 3 * 64) as u64;
    push_u32(&mut buf, 1); // PT_LOAD
    push_u32(&mut buf, 5); // R+X
    push_u64(&mut buf, 0); // p_offset
    push_u64(&mut buf, LOAD_VADDR);
    push_u64(&mut buf, LOAD_VADDR);
    push_u64(&mut buf, file_size);
    push_u64(&mut buf, file_size);
    push_u64(&mut buf, 0x1000);

    // Pad to the .text offset, then the payload and string table.
    buf.resize(TEXT_OFFSET as usize, 0);
    buf.extend_from_slice(text);
    buf.extend_from_slice(shstrtab);
    buf.resize(sh_off, 0);

    // Section headers: null, .text, .shstrtab.
    buf.extend_from_slice(&[0u8; 64]);

    push_u32(&mut buf, 1); // name ".text"
    push_u32(&mut buf, 1); // SHT_PROGBITS
    push_u64(&mut buf, 6); // ALLOC | EXECINSTR
    push_u64(&mut buf, TEXT_VADDR);
    push_u64(&mut buf, TEXT_OFFSET);
    push_u64(&mut buf, text.len() as u64);
    push_u32(&mut buf, 0);
    push_u32(&mut buf, 0);
    push_u64(&mut buf, 16);
    push_u64(&mut buf, 0);

    push_u32(&mut buf, 7); // name ".shstrtab"
    push_u32(&mut buf, 3); // SHT_STRTAB
    push_u64(&mut buf, 0);
    push_u64(&mut buf, 0);
    push_u64(&mut buf, str_off as u64);
    push_u64(&mut buf, shstrtab.len() as u64);
    push_u32(&mut buf, 0);
    push_u32(&mut buf, 0);
    push_u64(&mut buf, 1);
    push_u64(&mut buf, 0);

    buf
}
