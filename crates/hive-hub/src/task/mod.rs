mod manager;

pub use manager::{Assignee, CreateTaskRequest, Task, TaskError, TaskManager, TaskStatus};
