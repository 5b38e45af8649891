use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::State;

use log::warn;

use crate::common::ActivationDecision;
use crate::common::VirtualAssignment;
use crate::network_manager::{NetworkManager, ReleaseOutcome};
use crate::orchestrator::{Orchestrator, OrchestratorStatus, ProvisionOutcome};



#[get("/")]
async fn list_assignments(network: &State<Arc<NetworkManager>>) -> Json<Vec<VirtualAssignment>> {
	Json(network.assignments().await)
}

#[get("/<camera_id>")]
async fn get_assignment(camera_id: &str, network: &State<Arc<NetworkManager>>) -> Option<Json<VirtualAssignment>> {
	network.get(camera_id).await.map(Json)
}

#[post("/", data="<decision_json>")]
async fn provision_camera(decision_json: Json<ActivationDecision>, orchestrator: &State<Arc<Orchestrator>>) -> (Status, Json<ProvisionOutcome>) {
	let decision = decision_json.into_inner();
	let outcome = orchestrator.provision(&decision).await;
	let code = match outcome {
		ProvisionOutcome::Provisioned { .. } => Status::Created,
		ProvisionOutcome::AlreadyProvisioned { .. } => Status::Ok,
		ProvisionOutcome::Failed { .. } => Status::InternalServerError,
	};
	(code, Json(outcome))
}

#[delete("/<camera_id>")]
async fn release_camera(camera_id: &str, network: &State<Arc<NetworkManager>>) -> (Status, Value) {
	match network.release(camera_id).await {
		ReleaseOutcome::Released(assignment) => (Status::Ok, json!({
			"status": "released",
			"assignment": assignment,
		})),
		ReleaseOutcome::NotAssigned => (Status::NotFound, json!({
			"status": "error",
			"reason": format!("Camera {} has no virtual address.", camera_id),
		})),
		ReleaseOutcome::Kept { reason } => {
			warn!("Release of camera {} requested over the control API failed", camera_id);
			(Status::InternalServerError, json!({
				"status": "error",
				"reason": reason,
			}))
		},
	}
}

#[get("/status")]
async fn orchestrator_status(orchestrator: &State<Arc<Orchestrator>>) -> Json<OrchestratorStatus> {
	Json(orchestrator.status().await)
}

#[catch(404)]
fn not_found() -> Value {
	json!({
		"status": "error",
		"reason": "Resource was not found."
	})
}



pub fn stage(network: Arc<NetworkManager>, orchestrator: Arc<Orchestrator>) -> rocket::fairing::AdHoc {
	rocket::fairing::AdHoc::on_ignite("Control API", move |rocket| async move {
		rocket
			.manage(network)
			.manage(orchestrator)
			.register("/", catchers![not_found])
			.mount("/v0", routes![orchestrator_status])
			.mount("/v0/assignments", routes![list_assignments, get_assignment, provision_camera, release_camera])
	})
}
