//! 플러그인 PID 생존 확인
//!
//! 세션 모니터가 놓친 프로세스(예: 디버거 아래에서 분리된 자식)를 종료
//! 시점에 확인하는 용도입니다.

use sysinfo::{Pid, ProcessStatus, System};

/// 특정 PID가 실행 중인지 확인 (크로스 플랫폼)
///
/// 아직 수거되지 않은 좀비 프로세스는 실행 중으로 보지 않습니다.
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid))
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

// sysinfo는 OS 프로세스 테이블 전체를 동기적으로 스캔하므로
// 런타임 워커를 막지 않도록 spawn_blocking에서 실행합니다.

/// `is_running`의 비동기 래퍼.
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}
