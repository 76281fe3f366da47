//! 录制下来的命令，在 fence 被等待时按提交顺序在主机上执行

use std::cell::Cell;
use std::rc::Rc;

use crate::basic::desc::BufferImageCopyDesc;
use crate::emulated::memory::HostMemory;

#[derive(Clone)]
pub(crate) enum Command {
    BindPipeline,
    CopyBuffer {
        src: Rc<HostMemory>,
        src_offset: u64,
        dst: Rc<HostMemory>,
        dst_offset: u64,
        size: u64,
    },
    UpdateBuffer {
        data: Vec<u8>,
        dst: Rc<HostMemory>,
        dst_offset: u64,
    },
    CopyBufferToImage {
        src: Rc<HostMemory>,
        dst: Rc<HostMemory>,
        /// image 的宽高（texel）
        image_extent: [u32; 2],
        texel_size: u64,
        region: BufferImageCopyDesc,
    },
    PushConstants,
    Dispatch,
    Barrier,
    ResetTimestamps {
        offset: u32,
        count: u32,
    },
    WriteTimestamp {
        index: u32,
    },
    CopyTimestamps {
        dst: Rc<HostMemory>,
        offset: u32,
        count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

/// 一次提交：命令列表的快照加上完成时要 signal 的 fence
pub(crate) struct Submission {
    pub commands: Vec<Command>,
    pub fence: Rc<Cell<bool>>,
}

/// 执行命令时需要访问的设备状态
pub(crate) struct ExecutionState<'a> {
    pub timestamps: &'a mut [Option<u64>],
    pub clock: &'a Cell<u64>,
    pub dispatches: &'a Cell<u64>,
}

impl Command {
    pub(crate) fn execute(&self, state: &mut ExecutionState<'_>) {
        match self {
            Command::BindPipeline | Command::PushConstants | Command::Barrier => {}
            Command::Dispatch => state.dispatches.set(state.dispatches.get() + 1),
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => HostMemory::copy(src, *src_offset, dst, *dst_offset, *size),
            Command::UpdateBuffer { data, dst, dst_offset } => dst.write(*dst_offset, data),
            Command::CopyBufferToImage {
                src,
                dst,
                image_extent,
                texel_size,
                region,
            } => {
                // buffer 中按 region 的 extent 紧密排列，逐行拷贝到 image 的对应位置
                let row_size = region.texel_extent_x as u64 * texel_size;
                for z in 0..region.texel_extent_z as u64 {
                    for y in 0..region.texel_extent_y as u64 {
                        let src_offset =
                            region.buffer_offset + (z * region.texel_extent_y as u64 + y) * row_size;
                        let dst_texel = ((region.texel_offset_z as u64 + z) * image_extent[1] as u64
                            + region.texel_offset_y as u64
                            + y)
                            * image_extent[0] as u64
                            + region.texel_offset_x as u64;
                        HostMemory::copy(src, src_offset, dst, dst_texel * texel_size, row_size);
                    }
                }
            }
            Command::ResetTimestamps { offset, count } => {
                for slot in &mut state.timestamps[*offset as usize..(*offset + *count) as usize] {
                    *slot = None;
                }
            }
            Command::WriteTimestamp { index } => {
                let tick = state.clock.get() + 1;
                state.clock.set(tick);
                state.timestamps[*index as usize] = Some(tick);
            }
            Command::CopyTimestamps { dst, offset, count } => {
                let values: Vec<u8> = state.timestamps[*offset as usize..(*offset + *count) as usize]
                    .iter()
                    .flat_map(|t| t.unwrap_or(0).to_ne_bytes())
                    .collect();
                dst.write(0, &values);
            }
        }
    }
}
