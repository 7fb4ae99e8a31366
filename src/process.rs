use sysinfo::System;

pub const VORTEX_PROCESS_NAMES: &[&str] = &["Vortex.exe", "Vortex"];

pub struct ProcessChecker;

impl ProcessChecker {
    pub fn is_running(sys: &mut System, names: &[&str]) -> bool {
        sys.refresh_processes();
        sys.processes()
            .values()
            .any(|process| matches_name(process.name(), names))
    }

    pub fn vortex_running() -> bool {
        let mut sys = System::new();
        Self::is_running(&mut sys, VORTEX_PROCESS_NAMES)
    }
}

fn matches_name(name: &str, names: &[&str]) -> bool {
    names.iter().any(|target| name.eq_ignore_ascii_case(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_case_insensitively() {
        assert!(matches_name("vortex.EXE", VORTEX_PROCESS_NAMES));
        assert!(!matches_name("VortexHelper.exe", VORTEX_PROCESS_NAMES));
    }

    #[test]
    fn unknown_process_is_not_running() {
        let mut sys = System::new();
        assert!(!ProcessChecker::is_running(
            &mut sys,
            &["definitely-not-a-process-name-42"]
        ));
    }
}
