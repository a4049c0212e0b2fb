use p9mux::fcall::*;

/// Path elements to walk, ignoring empty and `.` components
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|name| !name.is_empty() && *name != ".")
        .collect()
}

/// `ls -l` style permission string, e.g. `d-rwxr-xr-x`
pub fn mode_string(mode: u32) -> String {
    let mut s = String::with_capacity(11);
    s.push(match mode {
        m if m & dm::DIR != 0 => 'd',
        m if m & dm::APPEND != 0 => 'a',
        m if m & dm::AUTH != 0 => 'A',
        _ => '-',
    });
    s.push(if mode & dm::EXCL != 0 { 'l' } else { '-' });

    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & dm::READ != 0 { 'r' } else { '-' });
        s.push(if bits & dm::WRITE != 0 { 'w' } else { '-' });
        s.push(if bits & dm::EXEC != 0 { 'x' } else { '-' });
    }
    s
}

pub fn format_dir(dir: &Dir) -> String {
    format!(
        "{} {:<8} {:<8} {:>10} {}",
        mode_string(dir.mode),
        dir.uid,
        dir.gid,
        dir.length,
        dir.name
    )
}
